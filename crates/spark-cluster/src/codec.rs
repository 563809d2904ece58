//! # codec：请求信封与响应帧
//!
//! ## 契约说明（What）
//! - 请求帧：`version: u8 | id_len: varint | id: UTF-8 | command: payload`；
//! - 响应帧：`len: varint | payload`，`len == 0` 为 not-found 哨兵，表示目标节点上没有该标识的分发器；
//!   其余情况下 `payload` 是 `Result<T, CommandError>` 按版本对应格式的编码；
//! - 版本表只追加不修改：已发布的版本号永远映射到同一种载荷格式。
//!
//! ## 实现策略（How）
//! - 版本号在工厂构造时解析一次（[`MarshallingVersion::from_u8`]），入站请求按帧内版本号解析；
//! - varint 采用 LEB128，最多 10 字节；
//! - 解码失败一律返回 [`CodecError`]，调用方决定回复错误还是丢弃。

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::command::{CommandError, CommandResponse};
use crate::dispatcher::DispatcherId;

const MAX_VARINT_LEN: usize = 10;

/// 编组版本。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum MarshallingVersion {
    /// 载荷使用 JSON。
    V1,
}

/// 版本号到载荷格式的映射表。
const VERSION_TABLE: &[(u8, MarshallingVersion, PayloadFormat)] =
    &[(1, MarshallingVersion::V1, PayloadFormat::Json)];

impl MarshallingVersion {
    pub const CURRENT: MarshallingVersion = MarshallingVersion::V1;

    pub fn from_u8(raw: u8) -> Result<Self, CodecError> {
        VERSION_TABLE
            .iter()
            .find(|(number, _, _)| *number == raw)
            .map(|(_, version, _)| *version)
            .ok_or(CodecError::UnsupportedVersion(raw))
    }

    pub fn as_u8(self) -> u8 {
        match self {
            MarshallingVersion::V1 => 1,
        }
    }

    pub fn format(self) -> PayloadFormat {
        VERSION_TABLE
            .iter()
            .find(|(_, version, _)| *version == self)
            .map(|(_, _, format)| *format)
            .unwrap_or(PayloadFormat::Json)
    }
}

/// 载荷序列化格式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadFormat {
    Json,
}

impl PayloadFormat {
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            PayloadFormat::Json => {
                serde_json::to_vec(value).map_err(|err| CodecError::Payload(err.to_string()))
            }
        }
    }

    pub fn decode<T: DeserializeOwned>(self, raw: &[u8]) -> Result<T, CodecError> {
        match self {
            PayloadFormat::Json => {
                serde_json::from_slice(raw).map_err(|err| CodecError::Payload(err.to_string()))
            }
        }
    }
}

/// 编解码失败。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame truncated: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("varint exceeds 10 bytes")]
    VarintOverflow,

    #[error("unsupported marshalling version {0}")]
    UnsupportedVersion(u8),

    #[error("dispatcher identifier is not valid UTF-8")]
    InvalidIdentifier,

    #[error("payload codec failure: {0}")]
    Payload(String),

    #[error("declared length {declared} does not match {available} available bytes")]
    LengthMismatch { declared: usize, available: usize },
}

/// 写入 LEB128 varint。
pub fn put_varint(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8(((value & 0x7f) as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// 读取 LEB128 varint。
pub fn get_varint(buf: &mut impl Buf) -> Result<u64, CodecError> {
    let mut value = 0u64;
    for index in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(CodecError::Truncated { needed: 1 });
        }
        let byte = buf.get_u8();
        let shift = 7 * index as u32;
        if index == MAX_VARINT_LEN - 1 && byte > 0x01 {
            return Err(CodecError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(CodecError::VarintOverflow)
}

/// 解码后的请求信封，命令载荷保持原始字节，由注册的分发器按自身命令类型解码。
#[derive(Clone, Debug)]
pub struct RequestEnvelope {
    version: MarshallingVersion,
    id: DispatcherId,
    command: Bytes,
}

impl RequestEnvelope {
    pub fn version(&self) -> MarshallingVersion {
        self.version
    }

    pub fn id(&self) -> &DispatcherId {
        &self.id
    }

    pub fn command(&self) -> &Bytes {
        &self.command
    }

    pub fn decode_command<K: DeserializeOwned>(&self) -> Result<K, CodecError> {
        self.version.format().decode(&self.command)
    }
}

/// 编码请求帧。
pub fn encode_request<K: Serialize>(
    version: MarshallingVersion,
    id: &DispatcherId,
    command: &K,
) -> Result<Bytes, CodecError> {
    let payload = version.format().encode(command)?;
    let id = id.as_str().as_bytes();
    let mut buf = BytesMut::with_capacity(1 + MAX_VARINT_LEN + id.len() + payload.len());
    buf.put_u8(version.as_u8());
    put_varint(&mut buf, id.len() as u64);
    buf.put_slice(id);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// 解码请求帧。
pub fn decode_request(mut frame: Bytes) -> Result<RequestEnvelope, CodecError> {
    if !frame.has_remaining() {
        return Err(CodecError::Truncated { needed: 1 });
    }
    let version = MarshallingVersion::from_u8(frame.get_u8())?;
    let id_len = get_varint(&mut frame)? as usize;
    if frame.remaining() < id_len {
        return Err(CodecError::Truncated {
            needed: id_len - frame.remaining(),
        });
    }
    let id = frame.split_to(id_len);
    let id = std::str::from_utf8(&id).map_err(|_| CodecError::InvalidIdentifier)?;
    Ok(RequestEnvelope {
        version,
        id: DispatcherId::from(id),
        command: frame,
    })
}

/// 响应帧解码结果。
#[derive(Debug, PartialEq)]
pub enum ResponseFrame<T> {
    Response(CommandResponse<T>),
    /// 目标节点上没有该标识的分发器。
    NotFound,
}

/// 编码执行结果（成功值或捕获的错误）。
pub fn encode_response<T: Serialize>(
    format: PayloadFormat,
    response: &CommandResponse<T>,
) -> Result<Bytes, CodecError> {
    Ok(frame_payload(format.encode(response)?))
}

/// 编码一次失败；与输出类型无关，任何 `decode_response::<T>` 都能读出该错误。
pub fn encode_failure(format: PayloadFormat, error: &CommandError) -> Result<Bytes, CodecError> {
    encode_response::<()>(format, &Err(error.clone()))
}

/// not-found 哨兵：长度为 0 的响应帧。
pub fn encode_not_found() -> Bytes {
    Bytes::from_static(&[0])
}

/// 解码响应帧。
pub fn decode_response<T: DeserializeOwned>(
    format: PayloadFormat,
    mut frame: Bytes,
) -> Result<ResponseFrame<T>, CodecError> {
    let declared = get_varint(&mut frame)? as usize;
    if declared != frame.remaining() {
        return Err(CodecError::LengthMismatch {
            declared,
            available: frame.remaining(),
        });
    }
    if declared == 0 {
        return Ok(ResponseFrame::NotFound);
    }
    let response = format.decode(&frame)?;
    Ok(ResponseFrame::Response(response))
}

fn frame_payload(payload: Vec<u8>) -> Bytes {
    let mut buf = BytesMut::with_capacity(MAX_VARINT_LEN + payload.len());
    put_varint(&mut buf, payload.len() as u64);
    buf.put_slice(&payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use proptest::prelude::*;
    use serde::Deserialize;

    #[derive(Clone, Debug, Serialize, Deserialize)]
    enum Ledger {
        Deposit { account: String, amount: u64 },
        Balance(String),
    }

    impl Command for Ledger {
        type Context = std::collections::HashMap<String, u64>;
        type Output = u64;

        fn execute(&self, accounts: &Self::Context) -> CommandResponse<u64> {
            match self {
                Ledger::Deposit { account, amount } => {
                    Ok(accounts.get(account).copied().unwrap_or_default() + amount)
                }
                Ledger::Balance(account) => accounts
                    .get(account)
                    .copied()
                    .ok_or_else(|| CommandError::new("ledger.unknown", account.clone())),
            }
        }
    }

    #[test]
    fn decoded_command_behaves_like_original() {
        let accounts = [("alice".to_owned(), 40)].into_iter().collect();
        let id = DispatcherId::from("ledger");
        for command in [
            Ledger::Deposit {
                account: "alice".into(),
                amount: 2,
            },
            Ledger::Balance("bob".into()),
        ] {
            let frame = encode_request(MarshallingVersion::CURRENT, &id, &command).expect("encode");
            let envelope = decode_request(frame).expect("decode");
            assert_eq!(envelope.id(), &id);
            let decoded: Ledger = envelope.decode_command().expect("payload");
            assert_eq!(decoded.execute(&accounts), command.execute(&accounts));
        }
    }

    #[test]
    fn not_found_sentinel_is_distinct_from_empty_results() {
        let format = MarshallingVersion::V1.format();
        assert_eq!(
            decode_response::<()>(format, encode_not_found()),
            Ok(ResponseFrame::NotFound)
        );
        let unit = encode_response(format, &Ok(())).expect("encode unit");
        assert_eq!(
            decode_response::<()>(format, unit),
            Ok(ResponseFrame::Response(Ok(())))
        );
    }

    #[test]
    fn failure_decodes_for_any_output_type() {
        let format = PayloadFormat::Json;
        let error = CommandError::new("svc.failed", "nope");
        let frame = encode_failure(format, &error).expect("encode failure");
        assert_eq!(
            decode_response::<Vec<String>>(format, frame),
            Ok(ResponseFrame::Response(Err(error)))
        );
    }

    #[test]
    fn malformed_requests_are_rejected() {
        assert_eq!(
            decode_request(Bytes::from_static(&[9, 0])).map(|_| ()),
            Err(CodecError::UnsupportedVersion(9))
        );
        assert!(matches!(
            decode_request(Bytes::from_static(&[1, 5, b'a'])),
            Err(CodecError::Truncated { needed: 4 })
        ));
        assert_eq!(
            decode_request(Bytes::from_static(&[1, 1, 0xff])).map(|_| ()),
            Err(CodecError::InvalidIdentifier)
        );
        assert_eq!(
            MarshallingVersion::from_u8(0),
            Err(CodecError::UnsupportedVersion(0))
        );
    }

    #[test]
    fn response_length_must_match_payload() {
        let frame = Bytes::from_static(&[3, b'{', b'}']);
        assert_eq!(
            decode_response::<()>(PayloadFormat::Json, frame),
            Err(CodecError::LengthMismatch {
                declared: 3,
                available: 2
            })
        );
    }

    proptest! {
        #[test]
        fn varint_roundtrip(value in any::<u64>()) {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, value);
            prop_assert!(buf.len() <= MAX_VARINT_LEN);
            let mut frozen = buf.freeze();
            prop_assert_eq!(get_varint(&mut frozen), Ok(value));
            prop_assert!(!frozen.has_remaining());
        }

        #[test]
        fn identifier_survives_envelope(id in "\\PC{0,40}") {
            let id = DispatcherId::from(id);
            let frame = encode_request(MarshallingVersion::V1, &id, &0u8).expect("encode");
            let envelope = decode_request(frame).expect("decode");
            prop_assert_eq!(envelope.id(), &id);
            prop_assert_eq!(envelope.decode_command::<u8>(), Ok(0));
        }
    }
}
