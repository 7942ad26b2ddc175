#![allow(unsafe_code)]
//! System V message queue carrying port mapping requests.
//!
//! `run` and `rm` post JSON-encoded [`PortMappingRequest`]s; the proxy daemon
//! drains them. Sends and receives never block.

use std::io;

use libc::{c_int, c_long};
use skiff_common::{SkiffError, SkiffResult};

use crate::portmap::{PortMappingRequest, PortMappingSink, PortMappingSource};

/// Well-known queue key shared by clients and the daemon.
#[allow(clippy::cast_possible_wrap)]
pub const QUEUE_KEY: libc::key_t = 0xDEAD_BEEF_u32 as libc::key_t;

/// Largest payload of one message.
pub const MAX_MESSAGE: usize = 1024;

const MESSAGE_TYPE: c_long = 1;

#[repr(C)]
struct RawMessage {
    mtype: c_long,
    mtext: [u8; MAX_MESSAGE],
}

/// Handle on a System V message queue.
#[derive(Debug)]
pub struct MessageQueue {
    id: c_int,
}

impl MessageQueue {
    /// Open the shared queue, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if `msgget` fails.
    pub fn open() -> SkiffResult<Self> {
        Self::open_key(QUEUE_KEY, libc::IPC_CREAT | 0o666)
    }

    /// Create a fresh queue only reachable through this handle.
    ///
    /// # Errors
    ///
    /// Returns an error if `msgget` fails.
    pub fn private() -> SkiffResult<Self> {
        Self::open_key(libc::IPC_PRIVATE, libc::IPC_CREAT | 0o600)
    }

    fn open_key(key: libc::key_t, flags: c_int) -> SkiffResult<Self> {
        // Safety: msgget takes no pointers.
        let id = unsafe { libc::msgget(key, flags) };
        if id < 0 {
            return Err(SkiffError::from_io(io::Error::last_os_error(), "msgget"));
        }
        Ok(Self { id })
    }

    /// Post `payload` as one message.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload exceeds [`MAX_MESSAGE`] or the queue is
    /// full.
    pub fn send_bytes(&self, payload: &[u8]) -> SkiffResult<()> {
        if payload.len() > MAX_MESSAGE {
            return Err(SkiffError::Config {
                message: format!(
                    "message of {} bytes exceeds the {MAX_MESSAGE} byte queue limit",
                    payload.len()
                ),
            });
        }

        let mut message = RawMessage {
            mtype: MESSAGE_TYPE,
            mtext: [0; MAX_MESSAGE],
        };
        message.mtext[..payload.len()].copy_from_slice(payload);

        // Safety: `message` is a valid msgbuf layout and outlives the call.
        let ret = unsafe {
            libc::msgsnd(
                self.id,
                std::ptr::from_ref(&message).cast(),
                payload.len(),
                libc::IPC_NOWAIT,
            )
        };
        if ret < 0 {
            return Err(SkiffError::from_io(io::Error::last_os_error(), "msgsnd"));
        }
        Ok(())
    }

    /// Take the oldest message, or `None` when the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if `msgrcv` fails for a reason other than an empty
    /// queue or an interrupted call.
    pub fn try_receive_bytes(&self) -> SkiffResult<Option<Vec<u8>>> {
        let mut message = RawMessage {
            mtype: 0,
            mtext: [0; MAX_MESSAGE],
        };

        // Safety: `message` is a valid msgbuf with room for MAX_MESSAGE bytes.
        let received = unsafe {
            libc::msgrcv(
                self.id,
                std::ptr::from_mut(&mut message).cast(),
                MAX_MESSAGE,
                0,
                libc::IPC_NOWAIT,
            )
        };
        if received < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::ENOMSG | libc::EAGAIN | libc::EINTR) => Ok(None),
                _ => Err(SkiffError::from_io(err, "msgrcv")),
            };
        }

        let len = usize::try_from(received).unwrap_or(0).min(MAX_MESSAGE);
        Ok(Some(message.mtext[..len].to_vec()))
    }

    /// Destroy the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if `msgctl(IPC_RMID)` fails.
    pub fn remove(self) -> SkiffResult<()> {
        // Safety: IPC_RMID ignores the buffer argument.
        let ret = unsafe { libc::msgctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(SkiffError::from_io(io::Error::last_os_error(), "msgctl"));
        }
        Ok(())
    }
}

impl PortMappingSink for MessageQueue {
    fn send(&self, request: &PortMappingRequest) -> SkiffResult<()> {
        let payload = serde_json::to_vec(request)?;
        self.send_bytes(&payload)
    }
}

impl PortMappingSource for MessageQueue {
    fn try_receive(&self) -> SkiffResult<Option<PortMappingRequest>> {
        loop {
            let Some(payload) = self.try_receive_bytes()? else {
                return Ok(None);
            };
            match serde_json::from_slice(&payload) {
                Ok(request) => return Ok(Some(request)),
                Err(e) => tracing::warn!(error = %e, "Dropping malformed port mapping message"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip_through_queue() {
        let queue = MessageQueue::private().unwrap();
        assert!(queue.try_receive().unwrap().is_none());

        let request = PortMappingRequest::mapping(vec!["8080:172.18.0.2:80".into()]);
        queue.send(&request).unwrap();
        assert_eq!(queue.try_receive().unwrap(), Some(request));
        assert!(queue.try_receive().unwrap().is_none());

        queue.remove().unwrap();
    }

    #[test]
    fn malformed_messages_are_skipped() {
        let queue = MessageQueue::private().unwrap();
        queue.send_bytes(b"not json").unwrap();
        queue.send_bytes(br#"{"PortUnMapping":["1:a:2"]}"#).unwrap();

        let request = queue.try_receive().unwrap().unwrap();
        assert_eq!(request.remove, vec!["1:a:2"]);

        queue.remove().unwrap();
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let queue = MessageQueue::private().unwrap();
        assert!(queue.send_bytes(&[b'x'; MAX_MESSAGE + 1]).is_err());
        queue.remove().unwrap();
    }
}
