//! C5 wire types: the job request payload and the connection-type tags
//! used on the vsock control/execute connections (spec §4.5/§6.7).

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// First byte of every vsock connection's initial read, selecting which of
/// the two roles the connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnType {
    Control = 0,
    Execute = 1,
}

impl ConnType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(ConnType::Control),
            1 => Some(ConnType::Execute),
            _ => None,
        }
    }
}

/// Byte written by the client on the control connection once it has read
/// the job's exit code, releasing the server's resources for that job.
pub const DONE: u8 = 2;

/// The only vsock context ID the daemon accepts connections from (the
/// host).
pub const HOST_CONTEXT_ID: u32 = 2;

/// Fixed vsock port the daemon listens on.
pub const PORT: u32 = 1;

/// A 4-byte random job handle, issued on a control connection and claimed
/// by a matching execute connection within the claim window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub [u8; 4]);

impl JobId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut bytes);
        JobId(bytes)
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() != 4 {
            return None;
        }
        let mut arr = [0u8; 4];
        arr.copy_from_slice(b);
        Some(JobId(arr))
    }

    pub fn as_bytes(&self) -> [u8; 4] {
        self.0
    }
}

/// What the client asked the entrypoint's namespace to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub with_stdin: bool,
    pub with_tty: bool,
}

impl JobRequest {
    pub fn encode(&self) -> runq_core::Result<Vec<u8>> {
        runq_core::codec::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> runq_core::Result<Self> {
        runq_core::codec::decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_type_roundtrip() {
        assert_eq!(ConnType::from_u8(0), Some(ConnType::Control));
        assert_eq!(ConnType::from_u8(1), Some(ConnType::Execute));
        assert_eq!(ConnType::from_u8(2), None);
    }

    #[test]
    fn test_job_id_random_is_four_bytes_and_varies() {
        let a = JobId::random();
        let b = JobId::random();
        assert_eq!(a.as_bytes().len(), 4);
        // astronomically unlikely to collide; guards against a constant stub
        assert_ne!(a, b);
    }

    #[test]
    fn test_job_id_from_bytes_rejects_wrong_length() {
        assert!(JobId::from_bytes(&[1, 2, 3]).is_none());
        assert!(JobId::from_bytes(&[1, 2, 3, 4, 5]).is_none());
        assert!(JobId::from_bytes(&[1, 2, 3, 4]).is_some());
    }

    #[test]
    fn test_job_request_roundtrip() {
        let jr = JobRequest {
            args: vec!["echo".into(), "hi".into()],
            env: vec!["FOO=bar".into()],
            with_stdin: true,
            with_tty: false,
        };
        let bytes = jr.encode().unwrap();
        let back = JobRequest::decode(&bytes).unwrap();
        assert_eq!(jr, back);
    }
}
