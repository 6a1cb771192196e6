use std::iter::Peekable;
use std::str::Chars;

use snafu::prelude::*;

use crate::status::StatusCode;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("missing command"))]
    MissingCommandError,
    #[snafu(display("command line too long: {} > {}", length, maximum))]
    TooLongError { length: usize, maximum: usize },
    #[snafu(display("missing response code"))]
    MissingCodeError,
    #[snafu(display("response code is not an integer: {}", operand))]
    NotIntegerError { operand: String },
    #[snafu(display("response code is not three digits: {}", operand))]
    WidthError { operand: String },
    #[snafu(display("unterminated quote in response: {}", line))]
    QuoteError { line: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One parsed response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: StatusCode,
    pub tokens: Vec<String>,
}

impl Response {
    pub fn new(code: StatusCode, tokens: Vec<String>) -> Response {
        Response { code, tokens }
    }
}

/// Turns an argument list into one command line, without the terminator.
pub trait CommandEncoder: Send + Sync {
    fn encode(&self, args: &[String]) -> Result<String>;
}

/// Turns one received line into a status code and its tokens.
pub trait ResponseParser: Send + Sync {
    fn parse(&self, line: &str) -> Result<Response>;
}

pub const TERMINATOR: &str = "\r\n";

#[derive(Debug, Clone)]
pub struct QuotingEncoder {
    max_length: usize,
}

impl QuotingEncoder {
    /// `max_length` counts bytes and includes the line terminator.
    pub fn new(max_length: usize) -> QuotingEncoder {
        QuotingEncoder { max_length }
    }
}

impl CommandEncoder for QuotingEncoder {
    fn encode(&self, args: &[String]) -> Result<String> {
        ensure!(!args.is_empty(), MissingCommandSnafu);

        let mut line = String::new();
        for arg in args {
            if !line.is_empty() {
                line.push(' ');
            }
            quote_into(&mut line, arg);
        }

        let length = line.len() + TERMINATOR.len();
        ensure!(
            length <= self.max_length,
            TooLongSnafu {
                length,
                maximum: self.max_length,
            }
        );

        Ok(line)
    }
}

fn needs_quotes(arg: &str) -> bool {
    arg.is_empty()
        || arg
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\'' || c == '\\')
}

fn quote_into(out: &mut String, arg: &str) {
    if !needs_quotes(arg) {
        out.push_str(arg);
        return;
    }

    out.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

#[derive(Debug, Clone, Default)]
pub struct TokenParser;

impl ResponseParser for TokenParser {
    fn parse(&self, line: &str) -> Result<Response> {
        let mut tokens = tokenize(line)?;
        if tokens.is_empty() {
            MissingCodeSnafu.fail()?
        }

        let code = parse_status_code(&tokens.remove(0))?;
        Ok(Response::new(code, tokens))
    }
}

/// Accepts exactly three ASCII digits; signs, padding and other widths are rejected.
pub fn parse_status_code(operand: &str) -> Result<StatusCode> {
    let bytes = operand.as_bytes();

    if !bytes.iter().all(u8::is_ascii_digit) || bytes.is_empty() {
        NotIntegerSnafu { operand }.fail()?
    }

    ensure!(bytes.len() == 3, WidthSnafu { operand });

    atoi::atoi::<u16>(bytes)
        .map(StatusCode::new)
        .ok_or_else(|| NotIntegerSnafu { operand }.build())
}

fn tokenize(line: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let Some(&first) = chars.peek() else {
            return Ok(tokens);
        };

        let token = match first {
            '"' | '\'' => {
                chars.next();
                quoted(&mut chars, first).ok_or_else(|| QuoteSnafu { line }.build())?
            }
            _ => bare(&mut chars),
        };
        tokens.push(token);
    }
}

fn bare(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut token = String::new();
    while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
        token.push(c);
    }
    token
}

// `None` when the closing quote is missing.
fn quoted(chars: &mut Peekable<Chars<'_>>, delimiter: char) -> Option<String> {
    let mut token = String::new();
    loop {
        match chars.next()? {
            '\\' => token.push(chars.next()?),
            c if c == delimiter => return Some(token),
            c => token.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn ts_on_encode() {
        let encoder = QuotingEncoder::new(1024);

        let line = encoder.encode(&args(&["DEFINE", "wn", "hello"])).unwrap();
        assert_eq!(line, "DEFINE wn hello");

        let line = encoder
            .encode(&args(&["MATCH", "*", "exact", "new york"]))
            .unwrap();
        assert_eq!(line, r#"MATCH * exact "new york""#);

        let line = encoder.encode(&args(&["DEFINE", "", r#"a"b\c"#])).unwrap();
        assert_eq!(line, r#"DEFINE "" "a\"b\\c""#);
    }

    #[test]
    fn ts_on_encode_rejects() {
        let encoder = QuotingEncoder::new(1024);
        assert!(matches!(
            encoder.encode(&[]),
            Err(Error::MissingCommandError)
        ));

        let mut long = Vec::new();
        while long.len() < 2048 {
            long.extend(args(&["DEFINE", "wn", "hello"]));
        }
        match encoder.encode(&long) {
            Err(Error::TooLongError { length, maximum }) => {
                assert!(length > 1024);
                assert_eq!(maximum, 1024);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn ts_on_length_counts_terminator() {
        // 9 bytes of text plus CRLF
        let encoder = QuotingEncoder::new(11);
        assert!(encoder.encode(&args(&["DEFINE", "x"])).is_ok());
        assert!(encoder.encode(&args(&["DEFINE", "xy"])).is_ok());
        assert!(encoder.encode(&args(&["DEFINE", "xyz"])).is_err());
    }

    #[test]
    fn ts_on_parse() {
        let parser = TokenParser;

        let response = parser
            .parse(r#"151 "hello" wn "WordNet (r) 3.0 (2006)""#)
            .unwrap();
        assert_eq!(response.code, StatusCode::new(151));
        assert_eq!(response.tokens, args(&["hello", "wn", "WordNet (r) 3.0 (2006)"]));

        let response = parser.parse("250   ok  'it\\'s'  ").unwrap();
        assert_eq!(response.code.as_u16(), 250);
        assert_eq!(response.tokens, args(&["ok", "it's"]));
    }

    #[test]
    fn ts_on_parse_rejects() {
        let parser = TokenParser;

        assert!(matches!(parser.parse(""), Err(Error::MissingCodeError)));
        assert!(matches!(parser.parse("   "), Err(Error::MissingCodeError)));
        assert!(matches!(parser.parse("25 OK"), Err(Error::WidthError { .. })));
        assert!(matches!(parser.parse("2500 OK"), Err(Error::WidthError { .. })));
        assert!(matches!(parser.parse("abc test"), Err(Error::NotIntegerError { .. })));
        assert!(matches!(parser.parse("-25 x"), Err(Error::NotIntegerError { .. })));
        assert!(matches!(parser.parse("+25 x"), Err(Error::NotIntegerError { .. })));
        assert!(matches!(parser.parse("250 \"open"), Err(Error::QuoteError { .. })));
    }

    #[test]
    fn ts_on_round_trip_through_quotes() {
        let line = QuotingEncoder::new(1024)
            .encode(&args(&["SHOW", "INFO", "a \"b\" c"]))
            .unwrap();
        let response = TokenParser.parse(&format!("250 {}", line)).unwrap();
        assert_eq!(response.tokens, args(&["SHOW", "INFO", "a \"b\" c"]));
    }
}
