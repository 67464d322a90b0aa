// src/engine/codec.rs
//
// Wire codec for the simulator's TCP control protocol (TraCI).
//
// Framing:
// - message  = i32 total length (including these 4 bytes) + commands
// - command  = u8 length (incl. itself, id and content) + u8 id + content,
//              or u8 0 + i32 length (incl. the 0, the i32 and the id) + id + content
// - response = status command (id, u8 result, string description) per request,
//              followed by an optional response command carrying the value
//
// All integers and doubles are big-endian.

use super::EngineError;
use crate::types::{Phase, PhaseProgram};

// Command ids.
pub const CMD_GETVERSION: u8 = 0x00;
pub const CMD_SIMSTEP: u8 = 0x02;
pub const CMD_CLOSE: u8 = 0x7F;
pub const CMD_GET_TL_VARIABLE: u8 = 0xa2;
pub const CMD_GET_LANE_VARIABLE: u8 = 0xa3;
pub const CMD_GET_SIM_VARIABLE: u8 = 0xab;
pub const CMD_SET_TL_VARIABLE: u8 = 0xc2;

/// Response command id for a GET command.
pub const fn response_id(get_command: u8) -> u8 {
    get_command.wrapping_add(0x10)
}

// Variable ids.
pub const ID_LIST: u8 = 0x00;
pub const LAST_STEP_VEHICLE_ID_LIST: u8 = 0x12;
pub const LAST_STEP_VEHICLE_HALTING_NUMBER: u8 = 0x14;
pub const TL_PHASE_INDEX: u8 = 0x22;
pub const TL_PROGRAM: u8 = 0x23;
pub const TL_CONTROLLED_LANES: u8 = 0x26;
pub const TL_CURRENT_PHASE: u8 = 0x28;
pub const TL_CURRENT_PROGRAM: u8 = 0x29;
pub const TL_COMPLETE_DEFINITION_RYG: u8 = 0x2b;
pub const VAR_MIN_EXPECTED_VEHICLES: u8 = 0x7d;

// Value type tags.
pub const TYPE_UBYTE: u8 = 0x07;
pub const TYPE_BYTE: u8 = 0x08;
pub const TYPE_INTEGER: u8 = 0x09;
pub const TYPE_DOUBLE: u8 = 0x0B;
pub const TYPE_STRING: u8 = 0x0C;
pub const TYPE_STRINGLIST: u8 = 0x0E;
pub const TYPE_COMPOUND: u8 = 0x0F;

// Status results.
pub const RTYPE_OK: u8 = 0x00;
pub const RTYPE_NOTIMPLEMENTED: u8 = 0x01;
pub const RTYPE_ERR: u8 = 0xFF;

/// A tagged protocol value.
#[derive(Debug, Clone, PartialEq)]
pub enum TraciValue {
    UByte(u8),
    Byte(i8),
    Int(i32),
    Double(f64),
    String(String),
    StringList(Vec<String>),
    Compound(Vec<TraciValue>),
}

impl TraciValue {
    pub fn as_int(&self) -> Option<i32> {
        match self {
            TraciValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            TraciValue::Double(v) => Some(*v),
            TraciValue::Int(v) => Some(f64::from(*v)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TraciValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_compound(&self) -> Option<&[TraciValue]> {
        match self {
            TraciValue::Compound(items) => Some(items),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            TraciValue::UByte(_) => "ubyte",
            TraciValue::Byte(_) => "byte",
            TraciValue::Int(_) => "int",
            TraciValue::Double(_) => "double",
            TraciValue::String(_) => "string",
            TraciValue::StringList(_) => "stringlist",
            TraciValue::Compound(_) => "compound",
        }
    }
}

/// Byte buffer writer for outgoing commands.
#[derive(Debug, Default, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn f64(&mut self, v: f64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        self.i32(s.len() as i32);
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    pub fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(b);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Frame one command (id + content) with the short or extended length header.
pub fn encode_command(id: u8, content: &[u8]) -> Vec<u8> {
    let mut enc = Encoder::new();
    let short_len = 1 + 1 + content.len();
    if short_len <= u8::MAX as usize {
        enc.u8(short_len as u8);
    } else {
        enc.u8(0).i32((1 + 4 + 1 + content.len()) as i32);
    }
    enc.u8(id).bytes(content);
    enc.into_inner()
}

/// Wrap commands into a message with the total-length header.
pub fn encode_message(commands: &[u8]) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.i32((4 + commands.len()) as i32).bytes(commands);
    enc.into_inner()
}

/// Content of a GET command: variable id + object id.
pub fn get_content(variable: u8, object_id: &str) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.u8(variable).string(object_id);
    enc.into_inner()
}

/// Content of a SET command carrying an integer.
pub fn set_int_content(variable: u8, object_id: &str, value: i32) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.u8(variable).string(object_id).u8(TYPE_INTEGER).i32(value);
    enc.into_inner()
}

/// Content of a SET command carrying a string.
pub fn set_string_content(variable: u8, object_id: &str, value: &str) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.u8(variable).string(object_id).u8(TYPE_STRING).string(value);
    enc.into_inner()
}

/// Cursor over a received message body.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], EngineError> {
        if self.remaining() < n {
            return Err(EngineError::Protocol(format!(
                "truncated response: wanted {n} byte(s) at offset {}, {} left",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, EngineError> {
        Ok(self.take(1)?[0])
    }

    pub fn i32(&mut self) -> Result<i32, EngineError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn f64(&mut self) -> Result<f64, EngineError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(f64::from_be_bytes(arr))
    }

    fn count(&mut self) -> Result<usize, EngineError> {
        let n = self.i32()?;
        usize::try_from(n).map_err(|_| EngineError::Protocol(format!("negative length {n}")))
    }

    pub fn string(&mut self) -> Result<String, EngineError> {
        let len = self.count()?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| EngineError::Protocol(format!("invalid utf-8 string: {e}")))
    }

    pub fn string_list(&mut self) -> Result<Vec<String>, EngineError> {
        let n = self.count()?;
        let mut out = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            out.push(self.string()?);
        }
        Ok(out)
    }

    /// Read a type tag followed by its value.
    pub fn value(&mut self) -> Result<TraciValue, EngineError> {
        let tag = self.u8()?;
        self.value_of(tag)
    }

    fn value_of(&mut self, tag: u8) -> Result<TraciValue, EngineError> {
        match tag {
            TYPE_UBYTE => Ok(TraciValue::UByte(self.u8()?)),
            TYPE_BYTE => Ok(TraciValue::Byte(self.u8()? as i8)),
            TYPE_INTEGER => Ok(TraciValue::Int(self.i32()?)),
            TYPE_DOUBLE => Ok(TraciValue::Double(self.f64()?)),
            TYPE_STRING => Ok(TraciValue::String(self.string()?)),
            TYPE_STRINGLIST => Ok(TraciValue::StringList(self.string_list()?)),
            TYPE_COMPOUND => {
                let n = self.count()?;
                let mut items = Vec::with_capacity(n.min(1024));
                for _ in 0..n {
                    items.push(self.value()?);
                }
                Ok(TraciValue::Compound(items))
            }
            other => Err(EngineError::Protocol(format!(
                "unsupported value type 0x{other:02x}"
            ))),
        }
    }

    /// Read a command header, returning the command id.
    pub fn command_header(&mut self) -> Result<u8, EngineError> {
        let short = self.u8()?;
        if short == 0 {
            let _extended = self.i32()?;
        }
        self.u8()
    }

    /// Read and check the status command for `expected` command id.
    pub fn status(&mut self, expected: u8) -> Result<(), EngineError> {
        let id = self.command_header()?;
        if id != expected {
            return Err(EngineError::Protocol(format!(
                "status for command 0x{id:02x}, expected 0x{expected:02x}"
            )));
        }
        let result = self.u8()?;
        let description = self.string()?;
        match result {
            RTYPE_OK => Ok(()),
            RTYPE_NOTIMPLEMENTED | RTYPE_ERR => Err(EngineError::CommandFailed {
                command: expected,
                description,
            }),
            other => Err(EngineError::Protocol(format!(
                "unknown status result 0x{other:02x} ({description})"
            ))),
        }
    }

    /// Read the response command of a GET and return its value.
    pub fn get_response(
        &mut self,
        get_command: u8,
        variable: u8,
    ) -> Result<TraciValue, EngineError> {
        let id = self.command_header()?;
        if id != response_id(get_command) {
            return Err(EngineError::Protocol(format!(
                "response id 0x{id:02x}, expected 0x{:02x}",
                response_id(get_command)
            )));
        }
        let var = self.u8()?;
        if var != variable {
            return Err(EngineError::Protocol(format!(
                "response variable 0x{var:02x}, expected 0x{variable:02x}"
            )));
        }
        let _object = self.string()?;
        self.value()
    }
}

pub fn expect_int(value: TraciValue) -> Result<i32, EngineError> {
    value
        .as_int()
        .ok_or_else(|| EngineError::Protocol(format!("expected int, got {}", value.type_name())))
}

pub fn expect_string(value: TraciValue) -> Result<String, EngineError> {
    match value {
        TraciValue::String(v) => Ok(v),
        other => Err(EngineError::Protocol(format!(
            "expected string, got {}",
            other.type_name()
        ))),
    }
}

pub fn expect_string_list(value: TraciValue) -> Result<Vec<String>, EngineError> {
    match value {
        TraciValue::StringList(v) => Ok(v),
        other => Err(EngineError::Protocol(format!(
            "expected stringlist, got {}",
            other.type_name()
        ))),
    }
}

/// Decode the first logic of a complete program definition.
///
/// Layout: compound of logics; each logic is a compound of
/// (program id, type, current phase, compound of phases, params); each phase
/// is a compound starting with (duration, state, ...).
pub fn parse_program_definition(value: &TraciValue) -> Result<PhaseProgram, EngineError> {
    let logics = value
        .as_compound()
        .ok_or_else(|| EngineError::Protocol("program definition is not a compound".into()))?;
    let logic = logics
        .iter()
        .find_map(TraciValue::as_compound)
        .ok_or_else(|| EngineError::Protocol("program definition has no logic".into()))?;
    let phases = logic
        .get(3)
        .and_then(TraciValue::as_compound)
        .ok_or_else(|| EngineError::Protocol("logic has no phase list".into()))?;

    let mut out = Vec::with_capacity(phases.len());
    for (i, phase) in phases.iter().enumerate() {
        let fields = phase
            .as_compound()
            .ok_or_else(|| EngineError::Protocol(format!("phase {i} is not a compound")))?;
        let duration = fields
            .first()
            .and_then(TraciValue::as_double)
            .ok_or_else(|| EngineError::Protocol(format!("phase {i} has no duration")))?;
        let state = fields
            .get(1)
            .and_then(TraciValue::as_str)
            .ok_or_else(|| EngineError::Protocol(format!("phase {i} has no state")))?;
        out.push(Phase::new(state, duration));
    }
    Ok(PhaseProgram::new(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_bytes(id: u8, result: u8, description: &str) -> Vec<u8> {
        let mut content = Encoder::new();
        content.u8(result).string(description);
        encode_command(id, &content.into_inner())
    }

    #[test]
    fn short_and_extended_command_headers() {
        let short = encode_command(CMD_SIMSTEP, &[0u8; 8]);
        assert_eq!(short[0], 10);
        assert_eq!(short[1], CMD_SIMSTEP);

        let long = encode_command(CMD_SET_TL_VARIABLE, &[0u8; 300]);
        assert_eq!(long[0], 0);
        assert_eq!(i32::from_be_bytes([long[1], long[2], long[3], long[4]]), 306);
        assert_eq!(long[5], CMD_SET_TL_VARIABLE);

        let mut dec = Decoder::new(&long);
        assert_eq!(dec.command_header().unwrap(), CMD_SET_TL_VARIABLE);
        assert_eq!(dec.remaining(), 300);
    }

    #[test]
    fn message_length_includes_header() {
        let cmd = encode_command(CMD_CLOSE, &[]);
        let msg = encode_message(&cmd);
        assert_eq!(i32::from_be_bytes([msg[0], msg[1], msg[2], msg[3]]), 6);
    }

    #[test]
    fn error_status_surfaces_description() {
        let bytes = status_bytes(CMD_GET_TL_VARIABLE, RTYPE_ERR, "Traffic light 'x' is not known");
        let mut dec = Decoder::new(&bytes);
        match dec.status(CMD_GET_TL_VARIABLE) {
            Err(EngineError::CommandFailed { description, .. }) => {
                assert!(description.contains("not known"))
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn get_response_reads_string_list() {
        let mut body = status_bytes(CMD_GET_TL_VARIABLE, RTYPE_OK, "");
        let mut resp = Encoder::new();
        resp.u8(TL_CONTROLLED_LANES)
            .string("J1")
            .u8(TYPE_STRINGLIST)
            .i32(3)
            .string("a_0")
            .string("a_0")
            .string("b_0");
        body.extend(encode_command(
            response_id(CMD_GET_TL_VARIABLE),
            &resp.into_inner(),
        ));

        let mut dec = Decoder::new(&body);
        dec.status(CMD_GET_TL_VARIABLE).unwrap();
        let value = dec
            .get_response(CMD_GET_TL_VARIABLE, TL_CONTROLLED_LANES)
            .unwrap();
        assert_eq!(
            expect_string_list(value).unwrap(),
            vec!["a_0", "a_0", "b_0"]
        );
    }

    #[test]
    fn truncated_input_is_a_protocol_error() {
        let mut dec = Decoder::new(&[0x00, 0x00]);
        assert!(matches!(dec.i32(), Err(EngineError::Protocol(_))));
    }

    #[test]
    fn program_definition_decodes_phases() {
        let mut enc = Encoder::new();
        // one logic
        enc.u8(TYPE_COMPOUND).i32(1);
        enc.u8(TYPE_COMPOUND).i32(5);
        enc.u8(TYPE_STRING).string("0");
        enc.u8(TYPE_INTEGER).i32(0);
        enc.u8(TYPE_INTEGER).i32(0);
        enc.u8(TYPE_COMPOUND).i32(2);
        for (dur, state) in [(31.0, "GGrr"), (4.0, "yyrr")] {
            enc.u8(TYPE_COMPOUND).i32(6);
            enc.u8(TYPE_DOUBLE).f64(dur);
            enc.u8(TYPE_STRING).string(state);
            enc.u8(TYPE_DOUBLE).f64(dur);
            enc.u8(TYPE_DOUBLE).f64(dur);
            enc.u8(TYPE_COMPOUND).i32(0);
            enc.u8(TYPE_STRING).string("");
        }
        enc.u8(TYPE_COMPOUND).i32(0);

        let bytes = enc.into_inner();
        let value = Decoder::new(&bytes).value().unwrap();
        let program = parse_program_definition(&value).unwrap();
        assert_eq!(program.len(), 2);
        assert_eq!(program.get(0).unwrap().state, "GGrr");
        assert_eq!(program.get(1).unwrap().nominal_duration, 4.0);
    }
}
