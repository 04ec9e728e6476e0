use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use crate::error::RelayError;

/// Reply from the external legality console.
#[derive(Debug, Clone, Deserialize)]
pub struct LegalityReply {
    pub legal: bool,
    #[serde(default)]
    pub report: Vec<String>,
}

/// Determines whether a save payload is legal for its generation.
///
/// The production implementation spawns an external console process per call;
/// tests substitute in-process fakes. One attempt per record - retries are the
/// caller's decision, and the migration engine never retries.
pub trait Verifier: Send + Sync {
    fn verify(&self, payload: &str, generation: &str) -> Result<LegalityReply, RelayError>;
}

/// Spawns the configured console binary with the save payload and generation
/// tag, expecting a JSON legality reply on stdout.
pub struct ConsoleVerifier {
    command: PathBuf,
}

impl ConsoleVerifier {
    pub fn new<P: Into<PathBuf>>(command: P) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &Path {
        &self.command
    }
}

impl Verifier for ConsoleVerifier {
    fn verify(&self, payload: &str, generation: &str) -> Result<LegalityReply, RelayError> {
        if !self.command.exists() {
            return Err(RelayError::Verifier(format!(
                "legality console binary is missing from disk: {}",
                self.command.display()
            )));
        }

        let output = Command::new(&self.command)
            .arg("--mode")
            .arg("legality")
            .arg("--save")
            .arg(payload)
            .arg("--generation")
            .arg(generation)
            .output()
            .map_err(|e| RelayError::Verifier(format!("failed to spawn legality console: {e}")))?;

        if !output.status.success() {
            return Err(RelayError::Verifier(format!(
                "legality console exited with status {}",
                output.status
            )));
        }

        parse_reply(&String::from_utf8_lossy(&output.stdout))
    }
}

/// The console reports failures as a JSON object with an "error" key rather
/// than a non-zero exit status.
fn parse_reply(stdout: &str) -> Result<LegalityReply, RelayError> {
    if stdout.contains("\"error\"") {
        return Err(RelayError::Verifier(
            "legality console returned an error".to_string(),
        ));
    }

    serde_json::from_str(stdout)
        .map_err(|e| RelayError::Verifier(format!("failed to parse legality reply: {e}")))
}
