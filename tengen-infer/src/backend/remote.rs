//! Out-of-process engine speaking a small binary protocol over TCP. One
//! batch is in flight at a time; the whole exchange is synchronous from the
//! dispatching thread's point of view.
//!
//! Every message on the wire is a u32 little-endian length prefix covering a
//! version word, a kind byte (plus three reserved bytes) and the
//! kind-specific body. The connection opens with a hello exchange that
//! reports the server's board geometry, batch size and model id, which are
//! validated against the local configuration before any evaluation runs.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Mutex;

use thiserror::Error;
use tracing::info;

use crate::error::{ConfigError, EvalError};
use crate::net::{Backend, EvalOutput};
use tengen_core::{BoardFeatures, BoardSpec};

pub const WIRE_VERSION: u32 = 1;

/// Upper bound on one message; a full 19x19 batch of 1024 positions is
/// around 25 MiB, so this leaves ample headroom without letting a corrupt
/// length prefix allocate unbounded memory.
pub const MAX_MSG_LEN: u32 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Hello = 1,
    HelloReply = 2,
    EvalRequest = 3,
    EvalReply = 4,
}

impl MsgKind {
    fn from_byte(b: u8) -> Option<MsgKind> {
        match b {
            1 => Some(MsgKind::Hello),
            2 => Some(MsgKind::HelloReply),
            3 => Some(MsgKind::EvalRequest),
            4 => Some(MsgKind::EvalReply),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(std::io::Error),
    #[error("peer closed the connection")]
    Disconnected,
    #[error("message of {len} bytes exceeds the {max} byte limit")]
    MsgTooLarge { len: u32, max: u32 },
    #[error("message truncated")]
    Truncated,
    #[error("unsupported wire version: {0}")]
    BadVersion(u32),
    #[error("unexpected message kind: {0}")]
    BadKind(u8),
    #[error("reply position count mismatch: got {got}, expected {expected}")]
    BadCount { got: u32, expected: u32 },
    #[error("reply policy length mismatch: got {got}, expected {expected}")]
    BadPolicyLen { got: u32, expected: u32 },
}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            WireError::Disconnected
        } else {
            WireError::Io(e)
        }
    }
}

/// Writes one message: length prefix, version word, kind byte plus reserved
/// padding, then the body.
pub fn send_msg<W: Write>(w: &mut W, kind: MsgKind, body: &[u8]) -> Result<(), WireError> {
    let len = u32::try_from(body.len() + 8).map_err(|_| WireError::MsgTooLarge {
        len: u32::MAX,
        max: MAX_MSG_LEN,
    })?;
    if len > MAX_MSG_LEN {
        return Err(WireError::MsgTooLarge {
            len,
            max: MAX_MSG_LEN,
        });
    }
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&WIRE_VERSION.to_le_bytes())?;
    w.write_all(&[kind as u8, 0, 0, 0])?;
    w.write_all(body)?;
    w.flush()?;
    Ok(())
}

/// Reads one message and returns its kind and body.
pub fn recv_msg<R: Read>(r: &mut R) -> Result<(MsgKind, Vec<u8>), WireError> {
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_MSG_LEN {
        return Err(WireError::MsgTooLarge {
            len,
            max: MAX_MSG_LEN,
        });
    }
    if (len as usize) < 8 {
        return Err(WireError::Truncated);
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;

    let mut rest = payload.as_slice();
    let version = take_u32(&mut rest)?;
    if version != WIRE_VERSION {
        return Err(WireError::BadVersion(version));
    }
    let kind_bytes = take(&mut rest, 4)?;
    let kind = MsgKind::from_byte(kind_bytes[0]).ok_or(WireError::BadKind(kind_bytes[0]))?;

    Ok((kind, rest.to_vec()))
}

fn take<'a>(body: &mut &'a [u8], n: usize) -> Result<&'a [u8], WireError> {
    if body.len() < n {
        return Err(WireError::Truncated);
    }
    let (head, tail) = body.split_at(n);
    *body = tail;
    Ok(head)
}

fn take_u32(body: &mut &[u8]) -> Result<u32, WireError> {
    let b = take(body, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn take_f32s(body: &mut &[u8], n: usize) -> Result<Vec<f32>, WireError> {
    let bytes = take(body, n * 4)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_f32s(out: &mut Vec<u8>, vs: &[f32]) {
    for &v in vs {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloReply {
    pub board_size: u32,
    pub batch_size: u32,
    pub model: String,
}

pub fn encode_hello_reply(reply: &HelloReply) -> Vec<u8> {
    let mut body = Vec::with_capacity(12 + reply.model.len());
    put_u32(&mut body, reply.board_size);
    put_u32(&mut body, reply.batch_size);
    put_u32(&mut body, reply.model.len() as u32);
    body.extend_from_slice(reply.model.as_bytes());
    body
}

pub fn decode_hello_reply(mut body: &[u8]) -> Result<HelloReply, WireError> {
    let board_size = take_u32(&mut body)?;
    let batch_size = take_u32(&mut body)?;
    let model_len = take_u32(&mut body)? as usize;
    let model = String::from_utf8_lossy(take(&mut body, model_len)?).into_owned();
    Ok(HelloReply {
        board_size,
        batch_size,
        model,
    })
}

pub fn encode_eval_request(features: &[BoardFeatures], feature_len: usize) -> Vec<u8> {
    let mut body = Vec::with_capacity(8 + features.len() * feature_len * 4);
    put_u32(&mut body, features.len() as u32);
    put_u32(&mut body, feature_len as u32);
    for item in features {
        debug_assert_eq!(item.len(), feature_len);
        put_f32s(&mut body, item);
    }
    body
}

pub fn decode_eval_request(mut body: &[u8]) -> Result<Vec<BoardFeatures>, WireError> {
    let count = take_u32(&mut body)? as usize;
    let feature_len = take_u32(&mut body)? as usize;
    (0..count).map(|_| take_f32s(&mut body, feature_len)).collect()
}

pub fn encode_eval_reply(policies: &[Vec<f32>], values: &[f32], policy_len: usize) -> Vec<u8> {
    let mut body = Vec::with_capacity(8 + (policies.len() * policy_len + values.len()) * 4);
    put_u32(&mut body, policies.len() as u32);
    put_u32(&mut body, policy_len as u32);
    for policy in policies {
        debug_assert_eq!(policy.len(), policy_len);
        put_f32s(&mut body, policy);
    }
    put_f32s(&mut body, values);
    body
}

pub fn decode_eval_reply(
    mut body: &[u8],
    expected_count: usize,
    expected_policy_len: usize,
) -> Result<(Vec<Vec<f32>>, Vec<f32>), WireError> {
    let count = take_u32(&mut body)?;
    if count as usize != expected_count {
        return Err(WireError::BadCount {
            got: count,
            expected: expected_count as u32,
        });
    }
    let policy_len = take_u32(&mut body)?;
    if policy_len as usize != expected_policy_len {
        return Err(WireError::BadPolicyLen {
            got: policy_len,
            expected: expected_policy_len as u32,
        });
    }
    let policies = (0..expected_count)
        .map(|_| take_f32s(&mut body, expected_policy_len))
        .collect::<Result<Vec<_>, _>>()?;
    let values = take_f32s(&mut body, expected_count)?;
    Ok((policies, values))
}

/// Engine delegating evaluation to a remote server.
pub struct RemoteBackend {
    stream: Mutex<TcpStream>,
    spec: BoardSpec,
    model: String,
}

impl std::fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBackend").field("model", &self.model).finish()
    }
}

impl RemoteBackend {
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        spec: BoardSpec,
        batch_size: usize,
    ) -> Result<Self, ConfigError> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true).ok();

        send_msg(&mut stream, MsgKind::Hello, &[])
            .map_err(|e| ConfigError::Handshake(e.to_string()))?;
        let (kind, body) =
            recv_msg(&mut stream).map_err(|e| ConfigError::Handshake(e.to_string()))?;
        if kind != MsgKind::HelloReply {
            return Err(ConfigError::Handshake(format!(
                "expected a hello reply, got {:?}",
                kind
            )));
        }
        let reply =
            decode_hello_reply(&body).map_err(|e| ConfigError::Handshake(e.to_string()))?;

        if reply.board_size as usize != spec.side() {
            return Err(ConfigError::Handshake(format!(
                "server board size {} does not match local {}",
                reply.board_size,
                spec.side()
            )));
        }
        if batch_size > 0 && (reply.batch_size as usize) < batch_size {
            return Err(ConfigError::Handshake(format!(
                "server batch size {} is smaller than local {}",
                reply.batch_size, batch_size
            )));
        }

        info!(
            "connected to remote engine, model {}, server batch size {}",
            reply.model, reply.batch_size
        );

        Ok(RemoteBackend {
            stream: Mutex::new(stream),
            spec,
            model: reply.model,
        })
    }
}

impl Backend for RemoteBackend {
    fn run(&self, features: Vec<BoardFeatures>) -> Result<EvalOutput, EvalError> {
        let count = features.len();
        let request = encode_eval_request(&features, self.spec.num_board_features());

        let mut stream = self.stream.lock().unwrap();
        send_msg(&mut *stream, MsgKind::EvalRequest, &request)
            .map_err(|e| EvalError::BackendFailed(e.to_string()))?;
        let (kind, body) =
            recv_msg(&mut *stream).map_err(|e| EvalError::BackendFailed(e.to_string()))?;
        drop(stream);

        if kind != MsgKind::EvalReply {
            return Err(EvalError::BackendFailed(format!(
                "expected an eval reply, got {:?}",
                kind
            )));
        }
        let (policies, values) = decode_eval_reply(&body, count, self.spec.num_moves())
            .map_err(|e| EvalError::BackendFailed(e.to_string()))?;

        Ok(EvalOutput {
            policies,
            values,
            model: self.model.clone(),
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::TcpListener;

    #[test]
    fn rejects_malformed_messages() {
        // Too short for even the version and kind words.
        let mut short = Vec::new();
        put_u32(&mut short, 4);
        short.extend_from_slice(&[0, 0, 0, 0]);
        assert!(matches!(
            recv_msg(&mut Cursor::new(short)),
            Err(WireError::Truncated)
        ));

        let mut wrong_version = Vec::new();
        put_u32(&mut wrong_version, 8);
        put_u32(&mut wrong_version, 9);
        wrong_version.extend_from_slice(&[MsgKind::Hello as u8, 0, 0, 0]);
        assert!(matches!(
            recv_msg(&mut Cursor::new(wrong_version)),
            Err(WireError::BadVersion(9))
        ));

        let mut unknown_kind = Vec::new();
        put_u32(&mut unknown_kind, 8);
        put_u32(&mut unknown_kind, WIRE_VERSION);
        unknown_kind.extend_from_slice(&[200, 0, 0, 0]);
        assert!(matches!(
            recv_msg(&mut Cursor::new(unknown_kind)),
            Err(WireError::BadKind(200))
        ));

        // A reply body cut off mid-policy.
        let reply = encode_eval_reply(&[vec![0.0; 82]], &[0.0], 82);
        assert!(matches!(
            decode_eval_reply(&reply[..10], 1, 82),
            Err(WireError::Truncated)
        ));
    }

    #[test]
    fn rejects_count_mismatch() {
        let reply = encode_eval_reply(&[vec![0.0; 3], vec![0.0; 3]], &[0.0, 0.0], 3);
        assert!(matches!(
            decode_eval_reply(&reply, 1, 3),
            Err(WireError::BadCount { got: 2, expected: 1 })
        ));
    }

    #[test]
    fn loopback_round_trip() {
        let spec = BoardSpec::new(9);
        let num_moves = spec.num_moves();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();

            let (kind, _body) = recv_msg(&mut conn).unwrap();
            assert_eq!(kind, MsgKind::Hello);
            let reply = HelloReply {
                board_size: 9,
                batch_size: 64,
                model: "remote-0001".to_string(),
            };
            send_msg(&mut conn, MsgKind::HelloReply, &encode_hello_reply(&reply)).unwrap();

            while let Ok((kind, body)) = recv_msg(&mut conn) {
                assert_eq!(kind, MsgKind::EvalRequest);
                let features = decode_eval_request(&body).unwrap();
                let policies = vec![vec![0.125; num_moves]; features.len()];
                let values = vec![-0.5; features.len()];
                send_msg(
                    &mut conn,
                    MsgKind::EvalReply,
                    &encode_eval_reply(&policies, &values, num_moves),
                )
                .unwrap();
            }
        });

        let backend = RemoteBackend::connect(addr, spec, 64).unwrap();
        assert_eq!(backend.model(), "remote-0001");

        let out = backend
            .run(vec![vec![0.0; spec.num_board_features()]; 2])
            .unwrap();
        assert_eq!(out.policies.len(), 2);
        assert_eq!(out.policies[0], vec![0.125; num_moves]);
        assert_eq!(out.values, vec![-0.5, -0.5]);
        assert_eq!(out.model, "remote-0001");

        drop(backend);
        server.join().unwrap();
    }

    #[test]
    fn board_size_mismatch_fails_handshake() {
        let spec = BoardSpec::new(19);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let _ = recv_msg(&mut conn).unwrap();
            let reply = HelloReply {
                board_size: 9,
                batch_size: 64,
                model: "remote-0001".to_string(),
            };
            send_msg(&mut conn, MsgKind::HelloReply, &encode_hello_reply(&reply)).unwrap();
        });

        let err = RemoteBackend::connect(addr, spec, 64).unwrap_err();
        assert!(matches!(err, ConfigError::Handshake(_)));
        server.join().unwrap();
    }
}
