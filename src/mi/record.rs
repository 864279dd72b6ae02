//! Machine-interface output parsing
//!
//! One debugger output line becomes one [`MiRecord`]. The grammar is the
//! usual GDB/MI shape: an optional numeric token, a type sigil (`^` result,
//! `*`/`=`/`+` async, `~`/`@`/`&` stream), then either a class/event name
//! with `key=value` results or a quoted c-string.

use crate::error::{Result, RigError};
use std::collections::HashMap;

/// A value inside a record payload
#[derive(Debug, Clone, PartialEq)]
pub enum MiValue {
    Const(String),
    Tuple(HashMap<String, MiValue>),
    List(Vec<MiValue>),
}

impl MiValue {
    /// Empty tuple, used when a record carries no results
    pub fn empty() -> Self {
        MiValue::Tuple(HashMap::new())
    }

    /// Look up a key in a tuple value
    pub fn get(&self, key: &str) -> Option<&MiValue> {
        match self {
            MiValue::Tuple(map) => map.get(key),
            _ => None,
        }
    }

    /// Look up a key and return its string content
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            MiValue::Const(s) => Some(s),
            _ => None,
        }
    }
}

/// Result record classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
}

impl ResultClass {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "done" => Ok(ResultClass::Done),
            // per the MI documentation, "running" and "stopped" result
            // classes are equivalent to "done" in async mode; run state
            // comes from notifications only
            "running" => Ok(ResultClass::Running),
            "connected" => Ok(ResultClass::Connected),
            "error" => Ok(ResultClass::Error),
            "exit" => Ok(ResultClass::Exit),
            other => Err(RigError::Internal(format!("Unknown result class '{}'", other))),
        }
    }
}

/// One parsed output record
#[derive(Debug, Clone, PartialEq)]
pub enum MiRecord {
    /// `^` record answering a tokenized command
    Result {
        token: Option<u64>,
        class: ResultClass,
        payload: MiValue,
    },
    /// `*`, `=` or `+` record: asynchronous event with a name and payload
    Notify {
        token: Option<u64>,
        event: String,
        payload: MiValue,
    },
    /// `~` record: console text
    Console(String),
    /// `@` record: target output
    Target(String),
    /// `&` record: debugger log text
    Log(String),
    /// `(gdb)` terminator
    Prompt,
}

/// Parse a single output line. Empty lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<MiRecord>> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Ok(None);
    }
    if line == "(gdb)" || line == "(gdb) " {
        return Ok(Some(MiRecord::Prompt));
    }

    let mut p = Parser::new(line);
    let token = p.take_token();

    let sigil = p
        .next_char()
        .ok_or_else(|| RigError::Internal(format!("Empty record after token: '{}'", line)))?;

    let record = match sigil {
        '^' => {
            let class = ResultClass::parse(&p.take_word())?;
            let payload = p.take_results()?;
            MiRecord::Result { token, class, payload }
        }
        '*' | '=' | '+' => {
            let event = p.take_word();
            let payload = p.take_results()?;
            MiRecord::Notify { token, event, payload }
        }
        '~' => MiRecord::Console(p.take_c_string()?),
        '@' => MiRecord::Target(p.take_c_string()?),
        '&' => MiRecord::Log(p.take_c_string()?),
        other => {
            return Err(RigError::Internal(format!(
                "Unknown record sigil '{}' in line '{}'",
                other, line
            )))
        }
    };

    Ok(Some(record))
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn next_char(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c as char)
    }

    fn take_token(&mut self) -> Option<u64> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if self.pos == start {
            return None;
        }
        std::str::from_utf8(&self.input[start..self.pos])
            .ok()?
            .parse()
            .ok()
    }

    fn take_word(&mut self) -> String {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'-' || c == b'_')
        {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    /// `,key=value` repetitions into a tuple; the record may end here
    fn take_results(&mut self) -> Result<MiValue> {
        let mut map = HashMap::new();
        while self.peek() == Some(b',') {
            self.pos += 1;
            let key = self.take_word();
            if self.peek() != Some(b'=') {
                return Err(self.error("expected '=' after result name"));
            }
            self.pos += 1;
            let value = self.take_value()?;
            map.insert(key, value);
        }
        Ok(MiValue::Tuple(map))
    }

    fn take_value(&mut self) -> Result<MiValue> {
        match self.peek() {
            Some(b'"') => Ok(MiValue::Const(self.take_c_string()?)),
            Some(b'{') => self.take_tuple(),
            Some(b'[') => self.take_list(),
            _ => Err(self.error("expected value")),
        }
    }

    fn take_tuple(&mut self) -> Result<MiValue> {
        self.pos += 1; // '{'
        let mut map = HashMap::new();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(MiValue::Tuple(map));
        }
        loop {
            let key = self.take_word();
            if self.peek() != Some(b'=') {
                return Err(self.error("expected '=' inside tuple"));
            }
            self.pos += 1;
            let value = self.take_value()?;
            map.insert(key, value);
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                }
                Some(b'}') => {
                    self.pos += 1;
                    break;
                }
                _ => return Err(self.error("expected ',' or '}' inside tuple")),
            }
        }
        Ok(MiValue::Tuple(map))
    }

    fn take_list(&mut self) -> Result<MiValue> {
        self.pos += 1; // '['
        let mut items = Vec::new();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(MiValue::List(items));
        }
        loop {
            // list elements are either plain values or named results;
            // named results become single-entry tuples
            let item = match self.peek() {
                Some(b'"') | Some(b'{') | Some(b'[') => self.take_value()?,
                _ => {
                    let key = self.take_word();
                    if self.peek() != Some(b'=') {
                        return Err(self.error("expected '=' inside list element"));
                    }
                    self.pos += 1;
                    let value = self.take_value()?;
                    let mut map = HashMap::new();
                    map.insert(key, value);
                    MiValue::Tuple(map)
                }
            };
            items.push(item);
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                }
                Some(b']') => {
                    self.pos += 1;
                    break;
                }
                _ => return Err(self.error("expected ',' or ']' inside list")),
            }
        }
        Ok(MiValue::List(items))
    }

    fn take_c_string(&mut self) -> Result<String> {
        if self.peek() != Some(b'"') {
            return Err(self.error("expected '\"'"));
        }
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string")),
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(b'n') => out.push(b'\n'),
                        Some(b't') => out.push(b'\t'),
                        Some(b'r') => out.push(b'\r'),
                        Some(b'\\') => out.push(b'\\'),
                        Some(b'"') => out.push(b'"'),
                        Some(c) => {
                            // keep unknown escapes verbatim
                            out.push(b'\\');
                            out.push(c);
                        }
                        None => return Err(self.error("dangling escape")),
                    }
                    self.pos += 1;
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn error(&self, what: &str) -> RigError {
        RigError::Internal(format!(
            "MI parse error at byte {}: {} in '{}'",
            self.pos,
            what,
            String::from_utf8_lossy(self.input)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_result_with_token() {
        let rec = parse_line("1000^done,value=\"42\"").unwrap().unwrap();
        match rec {
            MiRecord::Result { token, class, payload } => {
                assert_eq!(token, Some(1000));
                assert_eq!(class, ResultClass::Done);
                assert_eq!(payload.get_str("value"), Some("42"));
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_result() {
        let rec = parse_line("1001^error,msg=\"No symbol\"").unwrap().unwrap();
        match rec {
            MiRecord::Result { class, payload, .. } => {
                assert_eq!(class, ResultClass::Error);
                assert_eq!(payload.get_str("msg"), Some("No symbol"));
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn test_parse_stopped_notification() {
        let rec = parse_line(
            "*stopped,reason=\"breakpoint-hit\",bkptno=\"2\",frame={addr=\"0x08000100\",func=\"main\"}",
        )
        .unwrap()
        .unwrap();
        match rec {
            MiRecord::Notify { event, payload, .. } => {
                assert_eq!(event, "stopped");
                assert_eq!(payload.get_str("reason"), Some("breakpoint-hit"));
                assert_eq!(payload.get_str("bkptno"), Some("2"));
                assert_eq!(payload.get("frame").unwrap().get_str("func"), Some("main"));
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn test_parse_breakpoint_insert_reply() {
        let rec = parse_line(
            "1002^done,bkpt={number=\"1\",type=\"breakpoint\",addr=\"0x080001a4\",func=\"app_entry\"}",
        )
        .unwrap()
        .unwrap();
        match rec {
            MiRecord::Result { payload, .. } => {
                let bkpt = payload.get("bkpt").unwrap();
                assert_eq!(bkpt.get_str("number"), Some("1"));
                assert_eq!(bkpt.get_str("addr"), Some("0x080001a4"));
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn test_parse_console_with_escapes() {
        let rec = parse_line("~\"hello\\nworld\\\"x\\\"\"").unwrap().unwrap();
        assert_eq!(rec, MiRecord::Console("hello\nworld\"x\"".to_string()));
    }

    #[test]
    fn test_parse_list_of_results() {
        let rec = parse_line("^done,stack=[frame={level=\"0\"},frame={level=\"1\"}]")
            .unwrap()
            .unwrap();
        match rec {
            MiRecord::Result { payload, .. } => match payload.get("stack").unwrap() {
                MiValue::List(items) => assert_eq!(items.len(), 2),
                other => panic!("unexpected value: {:?}", other),
            },
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn test_parse_prompt_and_empty() {
        assert_eq!(parse_line("(gdb)").unwrap(), Some(MiRecord::Prompt));
        assert_eq!(parse_line("").unwrap(), None);
        assert_eq!(parse_line("\r\n").unwrap(), None);
    }

    #[test]
    fn test_parse_running_notification_without_reason() {
        let rec = parse_line("*running,thread-id=\"all\"").unwrap().unwrap();
        match rec {
            MiRecord::Notify { event, payload, .. } => {
                assert_eq!(event, "running");
                assert_eq!(payload.get_str("reason"), None);
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_line_is_error() {
        assert!(parse_line("^bogus-class").is_err());
        assert!(parse_line("!nonsense").is_err());
        assert!(parse_line("^done,key=").is_err());
    }
}
