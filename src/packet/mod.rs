//! Packet codec for the tunnel control channel
//!
//! A packet is one chat-message body: a single type tag character followed by
//! armored binary fields joined by `~`. The same tag characters are reused by
//! the two flow directions at the proxy host, so the codec is split into
//! [`InboundPacket`] (peer → host) and [`OutboundPacket`] (host → peer).
//!
//! Wire layouts (fields in order):
//!
//! ```text
//! i  encInit   reqseq:u32be  host:utf8  data:bytes
//! d  encData   reqseq:u32be  datseq:u32be  data:bytes
//! r  req       reqseq:u32be  hostname:utf8  port:u16be  path:utf8
//!              method:utf8  headers:utf8  body:bytes
//! D  reqData   reqseq:u32be  datseq:u32be  data:bytes
//! k  key       json:bytes
//!
//! r  res       reqseq:u32be  status:u16be  statusText:utf8
//!              headers:utf8  body:bytes
//! D  resData   reqseq:u32be  datseq:u32be  data:bytes
//! ```
//!
//! Headers travel as `name:value` lines joined by `\n`; a line is split at
//! its first colon, and a line without a colon is dropped on decode.

pub mod armor;

use bytes::Bytes;
use thiserror::Error;

/// Byte separating armored fields. Guaranteed absent from the armor alphabet.
pub const DELIMITER: char = '~';

/// Header list; repeated names are allowed and order is preserved.
pub type Headers = Vec<(String, String)>;

/// Codec errors. Decoding never panics; any malformed input maps here.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty message")]
    Empty,

    #[error("unknown packet tag: {0:?}")]
    UnknownTag(char),

    #[error("wrong field count for tag {tag:?}: expected {expected}, got {actual}")]
    FieldCount {
        tag: char,
        expected: usize,
        actual: usize,
    },

    #[error("invalid armor length: {0}")]
    BadArmorLength(usize),

    #[error("character outside armor alphabet: {0:?}")]
    BadCharacter(char),

    #[error("armor group out of range")]
    BadGroup,

    #[error("invalid armor padding count: {0}")]
    BadPadding(u8),

    #[error("scalar field {0} has wrong width")]
    BadScalar(&'static str),

    #[error("invalid UTF-8 in text field: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("invalid key material JSON: {0}")]
    KeyJson(#[from] serde_json::Error),
}

/// Packets the proxy host receives from the remote peer.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundPacket {
    /// Public-key announcement opening (or re-keying) a conversation.
    Key { key: serde_json::Value },
    /// Open a raw TCP tunnel; `data` is written right after connect.
    EncInit {
        reqseq: u32,
        host: String,
        data: Bytes,
    },
    /// One chunk of tunnel bytes, peer → upstream.
    EncData {
        reqseq: u32,
        datseq: u32,
        data: Bytes,
    },
    /// Open an HTTP exchange.
    Req {
        reqseq: u32,
        hostname: String,
        port: u16,
        path: String,
        method: String,
        headers: Headers,
        body: Bytes,
    },
    /// One chunk of HTTP request body.
    ReqData {
        reqseq: u32,
        datseq: u32,
        data: Bytes,
    },
}

/// Packets the proxy host sends back to the remote peer.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundPacket {
    /// Our public-key announcement, answering the peer's.
    Key { key: serde_json::Value },
    /// HTTP response head, emitted as soon as response headers arrive.
    Res {
        reqseq: u32,
        status: u16,
        status_text: String,
        headers: Headers,
        body: Bytes,
    },
    /// One chunk of HTTP response body.
    ResData {
        reqseq: u32,
        datseq: u32,
        data: Bytes,
    },
    /// One chunk of tunnel bytes, upstream → peer.
    EncData {
        reqseq: u32,
        datseq: u32,
        data: Bytes,
    },
}

impl InboundPacket {
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let (tag, fields) = split_message(text, &['k', 'i', 'd', 'r', 'D'])?;
        match tag {
            'k' => {
                expect_fields(tag, &fields, 1)?;
                Ok(InboundPacket::Key {
                    key: serde_json::from_slice(&fields[0])?,
                })
            }
            'i' => {
                expect_fields(tag, &fields, 3)?;
                Ok(InboundPacket::EncInit {
                    reqseq: scalar_u32(&fields[0], "reqseq")?,
                    host: utf8(&fields[1])?,
                    data: Bytes::from(fields.into_iter().nth(2).unwrap_or_default()),
                })
            }
            'd' => {
                expect_fields(tag, &fields, 3)?;
                Ok(InboundPacket::EncData {
                    reqseq: scalar_u32(&fields[0], "reqseq")?,
                    datseq: scalar_u32(&fields[1], "datseq")?,
                    data: Bytes::from(fields.into_iter().nth(2).unwrap_or_default()),
                })
            }
            'r' => {
                expect_fields(tag, &fields, 7)?;
                Ok(InboundPacket::Req {
                    reqseq: scalar_u32(&fields[0], "reqseq")?,
                    hostname: utf8(&fields[1])?,
                    port: scalar_u16(&fields[2], "port")?,
                    path: utf8(&fields[3])?,
                    method: utf8(&fields[4])?,
                    headers: decode_headers(&utf8(&fields[5])?),
                    body: Bytes::from(fields.into_iter().nth(6).unwrap_or_default()),
                })
            }
            'D' => {
                expect_fields(tag, &fields, 3)?;
                Ok(InboundPacket::ReqData {
                    reqseq: scalar_u32(&fields[0], "reqseq")?,
                    datseq: scalar_u32(&fields[1], "datseq")?,
                    data: Bytes::from(fields.into_iter().nth(2).unwrap_or_default()),
                })
            }
            other => Err(DecodeError::UnknownTag(other)),
        }
    }

    /// Encode for the peer → host direction. Exercised by the opposite
    /// tunnel endpoint and by the test suite.
    pub fn encode(&self) -> String {
        match self {
            InboundPacket::Key { key } => join('k', &[key.to_string().into_bytes()]),
            InboundPacket::EncInit { reqseq, host, data } => join(
                'i',
                &[
                    reqseq.to_be_bytes().to_vec(),
                    host.as_bytes().to_vec(),
                    data.to_vec(),
                ],
            ),
            InboundPacket::EncData {
                reqseq,
                datseq,
                data,
            } => join(
                'd',
                &[
                    reqseq.to_be_bytes().to_vec(),
                    datseq.to_be_bytes().to_vec(),
                    data.to_vec(),
                ],
            ),
            InboundPacket::Req {
                reqseq,
                hostname,
                port,
                path,
                method,
                headers,
                body,
            } => join(
                'r',
                &[
                    reqseq.to_be_bytes().to_vec(),
                    hostname.as_bytes().to_vec(),
                    port.to_be_bytes().to_vec(),
                    path.as_bytes().to_vec(),
                    method.as_bytes().to_vec(),
                    encode_headers(headers).into_bytes(),
                    body.to_vec(),
                ],
            ),
            InboundPacket::ReqData {
                reqseq,
                datseq,
                data,
            } => join(
                'D',
                &[
                    reqseq.to_be_bytes().to_vec(),
                    datseq.to_be_bytes().to_vec(),
                    data.to_vec(),
                ],
            ),
        }
    }
}

impl OutboundPacket {
    pub fn encode(&self) -> String {
        match self {
            OutboundPacket::Key { key } => join('k', &[key.to_string().into_bytes()]),
            OutboundPacket::Res {
                reqseq,
                status,
                status_text,
                headers,
                body,
            } => join(
                'r',
                &[
                    reqseq.to_be_bytes().to_vec(),
                    status.to_be_bytes().to_vec(),
                    status_text.as_bytes().to_vec(),
                    encode_headers(headers).into_bytes(),
                    body.to_vec(),
                ],
            ),
            OutboundPacket::ResData {
                reqseq,
                datseq,
                data,
            } => join(
                'D',
                &[
                    reqseq.to_be_bytes().to_vec(),
                    datseq.to_be_bytes().to_vec(),
                    data.to_vec(),
                ],
            ),
            OutboundPacket::EncData {
                reqseq,
                datseq,
                data,
            } => join(
                'd',
                &[
                    reqseq.to_be_bytes().to_vec(),
                    datseq.to_be_bytes().to_vec(),
                    data.to_vec(),
                ],
            ),
        }
    }

    /// Decode for the host → peer direction. Exercised by the opposite
    /// tunnel endpoint and by the test suite.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let (tag, fields) = split_message(text, &['k', 'r', 'D', 'd'])?;
        match tag {
            'k' => {
                expect_fields(tag, &fields, 1)?;
                Ok(OutboundPacket::Key {
                    key: serde_json::from_slice(&fields[0])?,
                })
            }
            'r' => {
                expect_fields(tag, &fields, 5)?;
                Ok(OutboundPacket::Res {
                    reqseq: scalar_u32(&fields[0], "reqseq")?,
                    status: scalar_u16(&fields[1], "status")?,
                    status_text: utf8(&fields[2])?,
                    headers: decode_headers(&utf8(&fields[3])?),
                    body: Bytes::from(fields.into_iter().nth(4).unwrap_or_default()),
                })
            }
            'D' => {
                expect_fields(tag, &fields, 3)?;
                Ok(OutboundPacket::ResData {
                    reqseq: scalar_u32(&fields[0], "reqseq")?,
                    datseq: scalar_u32(&fields[1], "datseq")?,
                    data: Bytes::from(fields.into_iter().nth(2).unwrap_or_default()),
                })
            }
            'd' => {
                expect_fields(tag, &fields, 3)?;
                Ok(OutboundPacket::EncData {
                    reqseq: scalar_u32(&fields[0], "reqseq")?,
                    datseq: scalar_u32(&fields[1], "datseq")?,
                    data: Bytes::from(fields.into_iter().nth(2).unwrap_or_default()),
                })
            }
            other => Err(DecodeError::UnknownTag(other)),
        }
    }
}

fn split_message(text: &str, known_tags: &[char]) -> Result<(char, Vec<Vec<u8>>), DecodeError> {
    let mut chars = text.chars();
    let tag = chars.next().ok_or(DecodeError::Empty)?;
    if !known_tags.contains(&tag) {
        return Err(DecodeError::UnknownTag(tag));
    }
    let fields = chars
        .as_str()
        .split(DELIMITER)
        .map(armor::decode)
        .collect::<Result<Vec<_>, _>>()?;
    Ok((tag, fields))
}

fn join(tag: char, fields: &[Vec<u8>]) -> String {
    let mut out = String::new();
    out.push(tag);
    let armored: Vec<String> = fields.iter().map(|f| armor::encode(f)).collect();
    out.push_str(&armored.join("~"));
    out
}

fn expect_fields(tag: char, fields: &[Vec<u8>], expected: usize) -> Result<(), DecodeError> {
    if fields.len() != expected {
        return Err(DecodeError::FieldCount {
            tag,
            expected,
            actual: fields.len(),
        });
    }
    Ok(())
}

fn scalar_u32(field: &[u8], name: &'static str) -> Result<u32, DecodeError> {
    let arr: [u8; 4] = field.try_into().map_err(|_| DecodeError::BadScalar(name))?;
    Ok(u32::from_be_bytes(arr))
}

fn scalar_u16(field: &[u8], name: &'static str) -> Result<u16, DecodeError> {
    let arr: [u8; 2] = field.try_into().map_err(|_| DecodeError::BadScalar(name))?;
    Ok(u16::from_be_bytes(arr))
}

fn utf8(field: &[u8]) -> Result<String, DecodeError> {
    Ok(String::from_utf8(field.to_vec())?)
}

fn encode_headers(headers: &Headers) -> String {
    headers
        .iter()
        .map(|(name, value)| format!("{}:{}", name, value))
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_headers(text: &str) -> Headers {
    text.split('\n')
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            // A line without a colon is malformed and dropped.
            line.split_once(':')
                .map(|(name, value)| (name.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enc_init_roundtrip() {
        let packet = InboundPacket::EncInit {
            reqseq: 7,
            host: "example.com:8443".to_string(),
            data: Bytes::from_static(b"\x16\x03\x01"),
        };
        let decoded = InboundPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_enc_data_roundtrip_max_sequences() {
        let packet = InboundPacket::EncData {
            reqseq: u32::MAX,
            datseq: u32::MAX,
            data: Bytes::new(),
        };
        let decoded = InboundPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_req_roundtrip_with_unicode_headers() {
        let packet = InboundPacket::Req {
            reqseq: 42,
            hostname: "example.com".to_string(),
            port: 443,
            path: "/search?q=тест".to_string(),
            method: "POST".to_string(),
            headers: vec![
                ("content-type".to_string(), "text/plain".to_string()),
                ("x-note".to_string(), "értelmes ärvo".to_string()),
                ("x-note".to_string(), "second value".to_string()),
            ],
            body: Bytes::from_static(b"hello"),
        };
        let decoded = InboundPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_req_roundtrip_empty_body_and_headers() {
        let packet = InboundPacket::Req {
            reqseq: 0,
            hostname: "localhost".to_string(),
            port: 80,
            path: "/".to_string(),
            method: "GET".to_string(),
            headers: vec![],
            body: Bytes::new(),
        };
        let decoded = InboundPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_req_data_roundtrip() {
        let packet = InboundPacket::ReqData {
            reqseq: 3,
            datseq: 0,
            data: Bytes::from_static(b"partial body"),
        };
        let decoded = InboundPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_outbound_enc_data_roundtrip() {
        let packet = OutboundPacket::EncData {
            reqseq: 1,
            datseq: 2,
            data: Bytes::from_static(b"\x00\x01\xFF"),
        };
        let decoded = OutboundPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_key_roundtrip() {
        let packet = InboundPacket::Key {
            key: serde_json::json!({"kty": "EC", "crv": "P-256", "x": "abc", "y": "def"}),
        };
        let decoded = InboundPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_res_roundtrip() {
        let packet = OutboundPacket::Res {
            reqseq: 9,
            status: 404,
            status_text: "Not Found".to_string(),
            headers: vec![("content-length".to_string(), "0".to_string())],
            body: Bytes::new(),
        };
        let decoded = OutboundPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_res_data_roundtrip() {
        let packet = OutboundPacket::ResData {
            reqseq: 9,
            datseq: 3,
            data: Bytes::from(vec![0u8; 1500]),
        };
        let decoded = OutboundPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_unknown_tag_fails() {
        assert!(matches!(
            InboundPacket::decode("x12345"),
            Err(DecodeError::UnknownTag('x'))
        ));
        assert!(matches!(InboundPacket::decode(""), Err(DecodeError::Empty)));
    }

    #[test]
    fn test_wrong_field_count_fails() {
        // encData with only two fields
        let text = format!(
            "d{}~{}",
            armor::encode(&1u32.to_be_bytes()),
            armor::encode(&2u32.to_be_bytes()),
        );
        assert!(matches!(
            InboundPacket::decode(&text),
            Err(DecodeError::FieldCount { tag: 'd', .. })
        ));
    }

    #[test]
    fn test_bad_armor_fails() {
        assert!(InboundPacket::decode("d????").is_err());
        assert!(InboundPacket::decode("d,,,,,").is_err());
    }

    #[test]
    fn test_scalar_width_enforced() {
        // a 2-byte field where reqseq expects 4 bytes
        let text = format!("d{0}~{0}~{0}", armor::encode(&[0u8, 1]));
        assert!(matches!(
            InboundPacket::decode(&text),
            Err(DecodeError::BadScalar("reqseq"))
        ));
    }

    #[test]
    fn test_header_line_without_colon_is_dropped() {
        let headers_text = "host:example.com\nmalformed line\naccept:*/*";
        let text = format!(
            "r{}~{}~{}~{}~{}~{}~{}",
            armor::encode(&5u32.to_be_bytes()),
            armor::encode(b"example.com"),
            armor::encode(&443u16.to_be_bytes()),
            armor::encode(b"/"),
            armor::encode(b"GET"),
            armor::encode(headers_text.as_bytes()),
            armor::encode(b""),
        );
        let decoded = InboundPacket::decode(&text).unwrap();
        match decoded {
            InboundPacket::Req { headers, .. } => {
                assert_eq!(
                    headers,
                    vec![
                        ("host".to_string(), "example.com".to_string()),
                        ("accept".to_string(), "*/*".to_string()),
                    ]
                );
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_header_value_split_at_first_colon() {
        let headers = vec![("referer".to_string(), "https://a.example/b".to_string())];
        let text = encode_headers(&headers);
        assert_eq!(decode_headers(&text), headers);
    }
}
