//! 帧编解码
//!
//! 线上格式: `[4 字节大端长度][UTF-8 JSON 文本]`，长度满足 `0 < length <= 65536`。
//!
//! [`FrameDecoder`] 是拉取式解析器：调用方把读到的字节喂进去，
//! 解码器缓存不完整的部分，每次最多交出一帧。

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{ProtocolError, Result};
use crate::{FRAME_HEADER_SIZE, MAX_FRAME_SIZE};

/// 为负载加上长度前缀
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.is_empty() {
        return Err(ProtocolError::EmptyFrame);
    }
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// 序列化消息为 JSON 并编码成帧
pub fn encode_message<M: Serialize>(msg: &M) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(msg)?;
    encode_frame(&payload)
}

/// 拉取式帧解码器
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加从流中读到的字节
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// 当前缓存但尚未解出的字节数
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// 尝试解出下一帧
    ///
    /// 数据不足时返回 `Ok(None)`；长度非法或内容不是 UTF-8 时返回错误，
    /// 此时调用方应当关闭连接。
    pub fn next_frame(&mut self) -> Result<Option<String>> {
        if self.buffer.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        // 长度在读到负载之前就校验，避免为恶意长度缓存数据
        if length == 0 || length > MAX_FRAME_SIZE {
            return Err(ProtocolError::InvalidLength {
                length,
                max: MAX_FRAME_SIZE,
            });
        }

        let total = FRAME_HEADER_SIZE + length;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let payload = self.buffer[FRAME_HEADER_SIZE..total].to_vec();
        self.buffer.drain(..total);

        String::from_utf8(payload)
            .map(Some)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// 解出下一帧并反序列化
    pub fn next_message<M: DeserializeOwned>(&mut self) -> Result<Option<M>> {
        match self.next_frame()? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }
}

/// 分片数据的 base64 编解码（仅在线上边界使用，内部一律是原始字节）
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_reads() {
        let frame = encode_message(&json!({"type": "ping"})).unwrap();
        let mut decoder = FrameDecoder::new();

        // 逐字节喂入，直到最后一个字节才能解出
        for byte in &frame[..frame.len() - 1] {
            decoder.extend(std::slice::from_ref(byte));
            assert!(decoder.next_frame().unwrap().is_none());
        }
        decoder.extend(&frame[frame.len() - 1..]);

        let text = decoder.next_frame().unwrap().unwrap();
        assert_eq!(text, r#"{"type":"ping"}"#);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let mut bytes = encode_frame(b"{\"a\":1}").unwrap();
        bytes.extend(encode_frame(b"{\"b\":2}").unwrap());
        bytes.extend(&encode_frame(b"{\"c\":3}").unwrap()[..3]);

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);

        let first: serde_json::Value = decoder.next_message().unwrap().unwrap();
        let second: serde_json::Value = decoder.next_message().unwrap().unwrap();
        assert_eq!(first["a"], 1);
        assert_eq!(second["b"], 2);
        // 第三帧只到了一半
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.buffered(), 3);
    }

    #[test]
    fn test_zero_length_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&0u32.to_be_bytes());
        assert!(matches!(
            decoder.next_frame(),
            Err(ProtocolError::InvalidLength { length: 0, .. })
        ));
    }

    #[test]
    fn test_oversized_length_rejected_before_payload() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
        assert!(matches!(
            decoder.next_frame(),
            Err(ProtocolError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_max_size_frame_accepted() {
        let payload = vec![b'x'; MAX_FRAME_SIZE];
        let frame = encode_frame(&payload).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame);
        assert_eq!(decoder.next_frame().unwrap().unwrap().len(), MAX_FRAME_SIZE);
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&encode_frame(&[0xff, 0xfe]).unwrap());
        assert!(matches!(decoder.next_frame(), Err(ProtocolError::InvalidUtf8)));
    }

    #[test]
    fn test_encoder_rejects_bad_sizes() {
        assert!(matches!(encode_frame(&[]), Err(ProtocolError::EmptyFrame)));

        let payload = vec![b'x'; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            encode_frame(&payload),
            Err(ProtocolError::FrameTooLarge { size, .. }) if size == MAX_FRAME_SIZE + 1
        ));
    }

    #[test]
    fn test_base64_field() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Chunk {
            #[serde(with = "base64_bytes")]
            data: Vec<u8>,
        }

        let text = serde_json::to_string(&Chunk { data: vec![0, 1, 2, 255] }).unwrap();
        assert_eq!(text, r#"{"data":"AAEC/w=="}"#);

        let bad: std::result::Result<Chunk, _> = serde_json::from_str(r#"{"data":"@@@"}"#);
        assert!(bad.is_err());
    }
}
