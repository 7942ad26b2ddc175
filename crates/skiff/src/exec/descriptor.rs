//! Startup message passed from the launcher to init over a pipe.

use std::fs::File;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use skiff_common::{SkiffError, SkiffResult};

/// What init needs to finish setting up and exec the user command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartupDescriptor {
    /// Command line to exec.
    pub cmds: Vec<String>,
    /// Working directory inside the container.
    pub work_dir: String,
    /// Container whose network namespace to share, by name or id prefix.
    pub shared_ns_container: String,
    /// Use the host's network namespace.
    pub host: bool,
}

impl StartupDescriptor {
    /// Write the descriptor to `pipe` and close it. The close is what tells
    /// init the message is complete.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn send(&self, mut pipe: File) -> SkiffResult<()> {
        let json = serde_json::to_vec(self)?;
        pipe.write_all(&json)
            .map_err(|e| SkiffError::from_io(e, "write startup descriptor"))?;
        drop(pipe);

        tracing::debug!(cmds = ?self.cmds, work_dir = %self.work_dir, "Sent startup descriptor");
        Ok(())
    }

    /// Read a descriptor from `reader` until EOF.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the payload is not a
    /// descriptor.
    pub fn receive<R: Read>(mut reader: R) -> SkiffResult<Self> {
        let mut payload = Vec::new();
        reader
            .read_to_end(&mut payload)
            .map_err(|e| SkiffError::from_io(e, "read startup descriptor"))?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Working directory, `/` when unset.
    #[must_use]
    pub fn work_dir(&self) -> &str {
        if self.work_dir.is_empty() {
            "/"
        } else {
            &self.work_dir
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StartupDescriptor {
        StartupDescriptor {
            cmds: vec!["sh".into(), "-c".into(), "echo hi".into()],
            work_dir: "/srv".into(),
            shared_ns_container: String::new(),
            host: false,
        }
    }

    #[test]
    fn wire_format() {
        let json = serde_json::to_string(&sample()).unwrap();
        insta::assert_snapshot!(json, @r#"{"cmds":["sh","-c","echo hi"],"workDir":"/srv","sharedNsContainer":"","host":false}"#);
    }

    #[test]
    fn pipe_roundtrip_then_eof() {
        let (read, write) = rustix::pipe::pipe().unwrap();
        sample().send(File::from(write)).unwrap();

        let mut reader = File::from(read);
        let received = StartupDescriptor::receive(&mut reader).unwrap();
        assert_eq!(received, sample());

        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn empty_work_dir_defaults_to_root() {
        let descriptor: StartupDescriptor = serde_json::from_str(r#"{"cmds":["ls"]}"#).unwrap();
        assert_eq!(descriptor.work_dir(), "/");
        assert!(!descriptor.host);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            StartupDescriptor::receive(&b"not json"[..]),
            Err(SkiffError::Serialization(_))
        ));
    }
}
