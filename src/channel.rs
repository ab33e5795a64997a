//! Channel URIs: `aeron:<media>[?key=value(|key=value)*]`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::logbuffer::descriptor::{TERM_MAX_LENGTH, TERM_MIN_LENGTH};
use crate::logbuffer::frame::{FRAME_ALIGNMENT, HEADER_LENGTH};
use crate::{Error, Result};

pub const SCHEME: &str = "aeron";
pub const TERM_LENGTH_PARAM: &str = "term-length";
pub const MTU_PARAM: &str = "mtu";
pub const MAX_MTU_LENGTH: usize = 64 * 1024;
/// Longest channel string accepted in a command.
pub const MAX_CHANNEL_LENGTH: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Media {
    Ipc,
    Udp,
}

impl Media {
    pub fn as_str(&self) -> &'static str {
        match self {
            Media::Ipc => "ipc",
            Media::Udp => "udp",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelUri {
    media: Media,
    params: BTreeMap<String, String>,
    original: String,
}

impl ChannelUri {
    pub fn parse(uri: &str) -> Result<Self> {
        if uri.is_empty() {
            return Err(Error::InvalidChannel("channel is empty".into()));
        }
        if uri.len() > MAX_CHANNEL_LENGTH {
            return Err(Error::InvalidChannel(format!(
                "channel length {} exceeds {MAX_CHANNEL_LENGTH}",
                uri.len()
            )));
        }
        let rest = uri
            .strip_prefix(SCHEME)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| Error::InvalidChannel(format!("missing '{SCHEME}:' prefix: {uri}")))?;
        let (media, query) = match rest.split_once('?') {
            Some((media, query)) => (media, Some(query)),
            None => (rest, None),
        };
        let media = match media {
            "ipc" => Media::Ipc,
            "udp" => Media::Udp,
            other => {
                return Err(Error::InvalidChannel(format!("unknown media '{other}': {uri}")));
            }
        };

        let mut params = BTreeMap::new();
        if let Some(query) = query {
            for pair in query.split('|').filter(|pair| !pair.is_empty()) {
                let (key, value) = pair.split_once('=').ok_or_else(|| {
                    Error::InvalidChannel(format!("parameter without value '{pair}': {uri}"))
                })?;
                if key.is_empty() {
                    return Err(Error::InvalidChannel(format!("empty parameter name: {uri}")));
                }
                params.insert(key.to_string(), value.to_string());
            }
        }

        let channel = Self {
            media,
            params,
            original: uri.to_string(),
        };
        channel.term_length()?;
        channel.mtu()?;
        Ok(channel)
    }

    pub fn media(&self) -> Media {
        self.media
    }

    pub fn is_ipc(&self) -> bool {
        self.media == Media::Ipc
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn as_str(&self) -> &str {
        &self.original
    }

    pub fn term_length(&self) -> Result<Option<usize>> {
        let Some(raw) = self.get(TERM_LENGTH_PARAM) else {
            return Ok(None);
        };
        let length = parse_size(raw)
            .ok_or_else(|| Error::InvalidChannel(format!("bad {TERM_LENGTH_PARAM}: {raw}")))?;
        if !(TERM_MIN_LENGTH..=TERM_MAX_LENGTH).contains(&length) || !length.is_power_of_two() {
            return Err(Error::InvalidChannel(format!(
                "{TERM_LENGTH_PARAM} must be a power of two in {TERM_MIN_LENGTH}..={TERM_MAX_LENGTH}: {raw}"
            )));
        }
        Ok(Some(length))
    }

    pub fn mtu(&self) -> Result<Option<usize>> {
        let Some(raw) = self.get(MTU_PARAM) else {
            return Ok(None);
        };
        let mtu = parse_size(raw)
            .ok_or_else(|| Error::InvalidChannel(format!("bad {MTU_PARAM}: {raw}")))?;
        if mtu <= HEADER_LENGTH || mtu > MAX_MTU_LENGTH || mtu % FRAME_ALIGNMENT != 0 {
            return Err(Error::InvalidChannel(format!(
                "{MTU_PARAM} must be a multiple of {FRAME_ALIGNMENT} in ({HEADER_LENGTH}, {MAX_MTU_LENGTH}]: {raw}"
            )));
        }
        Ok(Some(mtu))
    }
}

impl FromStr for ChannelUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ChannelUri::parse(s)
    }
}

impl fmt::Display for ChannelUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

/// Parses `65536`, `64k`, `1m` or `1g`.
fn parse_size(raw: &str) -> Option<usize> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.chars().last()? {
        'k' | 'K' => (&raw[..raw.len() - 1], 1024),
        'm' | 'M' => (&raw[..raw.len() - 1], 1024 * 1024),
        'g' | 'G' => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        _ => (raw, 1),
    };
    digits.parse::<usize>().ok()?.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::{parse_size, ChannelUri, Media};
    use crate::Error;

    #[test]
    fn parses_media_and_parameters() {
        let uri = ChannelUri::parse("aeron:ipc?term-length=64k|mtu=8192").expect("parse");
        assert_eq!(uri.media(), Media::Ipc);
        assert_eq!(uri.term_length().expect("term"), Some(64 * 1024));
        assert_eq!(uri.mtu().expect("mtu"), Some(8192));
        assert_eq!(uri.to_string(), "aeron:ipc?term-length=64k|mtu=8192");

        let udp: ChannelUri = "aeron:udp?endpoint=localhost:40123".parse().expect("udp");
        assert_eq!(udp.media(), Media::Udp);
        assert_eq!(udp.get("endpoint"), Some("localhost:40123"));
    }

    #[test]
    fn rejects_malformed_channels() {
        for bad in [
            "",
            "ipc",
            "aeron:tcp",
            "aeron:ipc?term-length",
            "aeron:ipc?term-length=1000",
            "aeron:ipc?mtu=33",
        ] {
            assert!(
                matches!(ChannelUri::parse(bad), Err(Error::InvalidChannel(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn size_suffixes() {
        assert_eq!(parse_size("65536"), Some(65536));
        assert_eq!(parse_size("1m"), Some(1 << 20));
        assert_eq!(parse_size("x"), None);
    }
}
