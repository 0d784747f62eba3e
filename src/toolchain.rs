//! Invocation of the external assembler that turns generated smali sources
//! into loadable dex form.
//!
//! The pipeline treats a non-zero exit as fatal: a partially assembled stub
//! or harness must never be linked into the output artifact.

use log::info;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::fail;
use crate::types::{HarnessError, HarnessResult};

/// Turns a tree of smali sources into a dex file. The production
/// implementation shells out; tests substitute an in-process fake.
pub trait Assembler {
    fn assemble(&self, source_dir: &Path, output: &Path) -> HarnessResult<()>;
}

/// Drives the `smali` command-line assembler.
pub struct SmaliAssembler {
    program: PathBuf,
}

impl SmaliAssembler {
    pub fn new(program: impl Into<PathBuf>) -> SmaliAssembler {
        SmaliAssembler {
            program: program.into(),
        }
    }
}

impl Default for SmaliAssembler {
    fn default() -> Self {
        SmaliAssembler::new("smali")
    }
}

impl Assembler for SmaliAssembler {
    fn assemble(&self, source_dir: &Path, output: &Path) -> HarnessResult<()> {
        info!(
            "assembling {} -> {}",
            source_dir.display(),
            output.display()
        );
        let result = Command::new(&self.program)
            .arg("assemble")
            .arg("-o")
            .arg(output)
            .arg(source_dir)
            .output();

        let output_status = match result {
            Ok(o) => o,
            Err(e) => {
                return Err(HarnessError::from(e)
                    .context(format!("running assembler {}", self.program.display())));
            }
        };

        if !output_status.status.success() {
            fail!(
                "assembler exited with {} for {}: {}",
                output_status.status,
                source_dir.display(),
                String::from_utf8_lossy(&output_status.stderr)
            );
        }
        Ok(())
    }
}
