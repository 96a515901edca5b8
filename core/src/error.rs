use thiserror::Error;

/// runq error taxonomy (spec §7).
///
/// Each variant corresponds to one of the seven error kinds implementers
/// must preserve: configuration, boot, protocol, hypervisor, child-process,
/// cleanup, and vsock errors.
#[derive(Error, Debug)]
pub enum RunqError {
    /// Bad disk ID, unknown capability name, unrecognised cache mode,
    /// unresolvable UUID, invalid env DSL, descriptor mismatch caught
    /// before VM start.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Missing virtio port, kernel-module load failure, 9p mount failure,
    /// serial-based disk lookup returning empty.
    #[error("boot error: {0}")]
    Boot(String),

    /// Short read on C2, unknown message type, descriptor decode failure.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// git-commit fingerprint mismatch between host-built and guest-built
    /// binaries; unrecoverable.
    #[error("binary mismatch: host commit {host} != guest commit {guest}")]
    BinaryMismatch { host: String, guest: String },

    /// Early hypervisor exit before boot ack, or crash mid-run.
    #[error("hypervisor failure: {0}")]
    HypervisorFailure(String),

    /// exec failed, or the child was killed by a signal; carries the
    /// already-mapped §6.8 exit code.
    #[error("child process error: {message} (exit code {code})")]
    ChildProcess { message: String, code: i32 },

    /// Residual mount, unkillable process. Logged, never fatal to the
    /// reboot path.
    #[error("cleanup error: {0}")]
    Cleanup(String),

    /// TLS handshake failure, unknown context ID, unknown job ID,
    /// registration timeout.
    #[error("vsock error: {0}")]
    Vsock(String),

    /// Codec failure: `decode(encode(x)) != x`, or an unknown field/tag.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for RunqError {
    fn from(err: bincode::Error) -> Self {
        RunqError::Codec(err.to_string())
    }
}

/// Result type alias for runq operations.
pub type Result<T> = std::result::Result<T, RunqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_display() {
        let e = RunqError::Configuration("duplicate disk ID".into());
        assert_eq!(e.to_string(), "configuration error: duplicate disk ID");
    }

    #[test]
    fn test_boot_display() {
        let e = RunqError::Boot("no virtio port found".into());
        assert_eq!(e.to_string(), "boot error: no virtio port found");
    }

    #[test]
    fn test_protocol_display() {
        let e = RunqError::Protocol("short read on header".into());
        assert_eq!(e.to_string(), "protocol error: short read on header");
    }

    #[test]
    fn test_binary_mismatch_display() {
        let e = RunqError::BinaryMismatch {
            host: "abc123".into(),
            guest: "def456".into(),
        };
        assert_eq!(
            e.to_string(),
            "binary mismatch: host commit abc123 != guest commit def456"
        );
    }

    #[test]
    fn test_hypervisor_failure_display() {
        let e = RunqError::HypervisorFailure("early exit, status 1".into());
        assert_eq!(e.to_string(), "hypervisor failure: early exit, status 1");
    }

    #[test]
    fn test_child_process_display() {
        let e = RunqError::ChildProcess {
            message: "killed by signal 15".into(),
            code: 143,
        };
        assert_eq!(
            e.to_string(),
            "child process error: killed by signal 15 (exit code 143)"
        );
    }

    #[test]
    fn test_cleanup_display() {
        let e = RunqError::Cleanup("residual mount at /rootfs/tmp".into());
        assert_eq!(e.to_string(), "cleanup error: residual mount at /rootfs/tmp");
    }

    #[test]
    fn test_vsock_display() {
        let e = RunqError::Vsock("unknown job id".into());
        assert_eq!(e.to_string(), "vsock error: unknown job id");
    }

    #[test]
    fn test_io_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing device");
        let err: RunqError = io_error.into();
        assert!(matches!(err, RunqError::Io(_)));
        assert!(err.to_string().contains("missing device"));
    }

    #[test]
    fn test_result_alias() {
        fn ok() -> Result<i32> {
            Ok(7)
        }
        fn err() -> Result<i32> {
            Err(RunqError::Configuration("bad".into()))
        }
        assert_eq!(ok().unwrap(), 7);
        assert!(err().is_err());
    }
}
