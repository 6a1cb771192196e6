use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use snafu::{prelude::*, ResultExt};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read config file {}: {}", path.display(), source))]
    ReadError { path: PathBuf, source: io::Error },
    #[snafu(display("failed to parse config: {}", source))]
    ParseError { source: toml::de::Error },
    #[snafu(display("character {:?} can not be encoded as {}", ch, encoding))]
    UnmappableError { ch: char, encoding: &'static str },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Character encoding applied to both directions of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum TextEncoding {
    #[default]
    #[serde(rename = "utf-8", alias = "UTF-8", alias = "utf8")]
    Utf8,
    #[serde(rename = "iso-8859-1", alias = "ISO-8859-1", alias = "latin1")]
    Latin1,
}

impl TextEncoding {
    pub fn name(self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Latin1 => "iso-8859-1",
        }
    }

    pub fn encode(self, text: &str) -> Result<Vec<u8>> {
        match self {
            TextEncoding::Utf8 => Ok(text.as_bytes().to_vec()),
            TextEncoding::Latin1 => text
                .chars()
                .map(|ch| {
                    u8::try_from(u32::from(ch)).map_err(|_| {
                        UnmappableSnafu {
                            ch,
                            encoding: self.name(),
                        }
                        .build()
                    })
                })
                .collect(),
        }
    }

    /// Returns `None` when the bytes are not valid in this encoding.
    pub fn decode(self, bytes: &[u8]) -> Option<String> {
        match self {
            TextEncoding::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_string),
            // every byte is a valid latin-1 code point
            TextEncoding::Latin1 => Some(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name or address of the dictionary server.
    pub host: String,
    pub port: u16,
    /// Longest command line accepted for transmission, in bytes, CRLF included.
    pub max_line_length: usize,
    pub encoding: TextEncoding,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "dict.org".to_string(),
            port: 2628,
            max_line_length: 1024,
            encoding: TextEncoding::Utf8,
        }
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Config> {
        toml::from_str(text).context(ParseSnafu)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        Config::from_toml_str(&text)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
