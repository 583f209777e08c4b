//! Packet model and per-type field schemas
//!
//! Each built-in packet type has a fixed, ordered field schema. Encode and
//! decode both walk that table, so field order on the wire is always the
//! declared order.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{CodecError, Value, ValueKind, WireBuffer, PROTOCOL_VERSION};

/// First opcode available to application-defined packets
pub const FIRST_APPLICATION_OPCODE: u8 = 8;

/// Packet types (opcode = ordinal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Discovery,
    DiscoveryConfirm,
    Handshake,
    HandshakeConfirm,
    HandshakeRefuse,
    Ping,
    Pong,
    ConnectionKilled,
    /// Consumer-defined opcode, always `>= FIRST_APPLICATION_OPCODE`
    Application(u8),
}

/// One declared field of a packet schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSchema {
    pub name: &'static str,
    pub kind: ValueKind,
    /// Write signed integers with the unsigned tag of the same width
    pub unsigned: bool,
}

impl FieldSchema {
    const fn new(name: &'static str, kind: ValueKind) -> Self {
        Self {
            name,
            kind,
            unsigned: false,
        }
    }

    const fn unsigned(name: &'static str, kind: ValueKind) -> Self {
        Self {
            name,
            kind,
            unsigned: true,
        }
    }

    /// The tag actually found on the wire for this field
    pub fn encoded_kind(&self) -> ValueKind {
        if self.unsigned {
            self.kind.unsigned()
        } else {
            self.kind
        }
    }

    fn accepts(&self, kind: ValueKind) -> bool {
        kind == self.kind || kind == self.encoded_kind()
    }
}

const NO_FIELDS: &[FieldSchema] = &[];
const DISCOVERY_CONFIRM_FIELDS: &[FieldSchema] = &[FieldSchema::new("platform", ValueKind::Str)];
const HANDSHAKE_REFUSE_FIELDS: &[FieldSchema] = &[FieldSchema::new("reason", ValueKind::Str)];
const TRACE_FIELDS: &[FieldSchema] = &[FieldSchema::unsigned("id", ValueKind::Long)];
const CONNECTION_KILLED_FIELDS: &[FieldSchema] = &[FieldSchema::new("exit_code", ValueKind::Int)];

impl PacketType {
    pub fn opcode(self) -> u8 {
        match self {
            PacketType::Discovery => 0,
            PacketType::DiscoveryConfirm => 1,
            PacketType::Handshake => 2,
            PacketType::HandshakeConfirm => 3,
            PacketType::HandshakeRefuse => 4,
            PacketType::Ping => 5,
            PacketType::Pong => 6,
            PacketType::ConnectionKilled => 7,
            PacketType::Application(opcode) => opcode,
        }
    }

    pub fn from_opcode(opcode: u8) -> Self {
        match opcode {
            0 => PacketType::Discovery,
            1 => PacketType::DiscoveryConfirm,
            2 => PacketType::Handshake,
            3 => PacketType::HandshakeConfirm,
            4 => PacketType::HandshakeRefuse,
            5 => PacketType::Ping,
            6 => PacketType::Pong,
            7 => PacketType::ConnectionKilled,
            other => PacketType::Application(other),
        }
    }

    /// Ordered field schema. Application packets are free-form and report
    /// an empty schema.
    pub fn schema(self) -> &'static [FieldSchema] {
        match self {
            PacketType::Discovery | PacketType::Handshake | PacketType::HandshakeConfirm => {
                NO_FIELDS
            }
            PacketType::DiscoveryConfirm => DISCOVERY_CONFIRM_FIELDS,
            PacketType::HandshakeRefuse => HANDSHAKE_REFUSE_FIELDS,
            PacketType::Ping | PacketType::Pong => TRACE_FIELDS,
            PacketType::ConnectionKilled => CONNECTION_KILLED_FIELDS,
            PacketType::Application(_) => NO_FIELDS,
        }
    }

    /// Whether frames of this type can carry tagged values
    pub fn carries_fields(self) -> bool {
        matches!(self, PacketType::Application(_)) || !self.schema().is_empty()
    }

    /// Built-in protocol packets, handled by the base listener
    pub fn is_reserved(self) -> bool {
        !matches!(self, PacketType::Application(_))
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Discovery => write!(f, "DISCOVERY"),
            PacketType::DiscoveryConfirm => write!(f, "DISCOVERY_CONFIRM"),
            PacketType::Handshake => write!(f, "HANDSHAKE"),
            PacketType::HandshakeConfirm => write!(f, "HANDSHAKE_CONFIRM"),
            PacketType::HandshakeRefuse => write!(f, "HANDSHAKE_REFUSE"),
            PacketType::Ping => write!(f, "PING"),
            PacketType::Pong => write!(f, "PONG"),
            PacketType::ConnectionKilled => write!(f, "CONNECTION_KILLED"),
            PacketType::Application(opcode) => write!(f, "APPLICATION({})", opcode),
        }
    }
}

/// Packet payloads
#[derive(Debug, Clone, PartialEq)]
pub enum PacketBody {
    Discovery,
    DiscoveryConfirm { platform: String },
    Handshake,
    HandshakeConfirm,
    HandshakeRefuse { reason: String },
    /// Traceable: `id` pairs the ping with its pong
    Ping { id: u64 },
    Pong { id: u64 },
    ConnectionKilled { exit_code: i32 },
    Application { opcode: u8, fields: Vec<Value> },
}

/// An immutable packet: protocol version plus typed body
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    version: u8,
    body: PacketBody,
}

impl Packet {
    /// Build a packet stamped with the current protocol version
    pub fn new(body: PacketBody) -> Self {
        Self::with_version(PROTOCOL_VERSION, body)
    }

    pub fn with_version(version: u8, body: PacketBody) -> Self {
        Self { version, body }
    }

    pub fn discovery() -> Self {
        Self::new(PacketBody::Discovery)
    }

    pub fn discovery_confirm(platform: impl Into<String>) -> Self {
        Self::new(PacketBody::DiscoveryConfirm {
            platform: platform.into(),
        })
    }

    pub fn handshake() -> Self {
        Self::new(PacketBody::Handshake)
    }

    pub fn handshake_confirm() -> Self {
        Self::new(PacketBody::HandshakeConfirm)
    }

    pub fn handshake_refuse(reason: impl Into<String>) -> Self {
        Self::new(PacketBody::HandshakeRefuse {
            reason: reason.into(),
        })
    }

    /// A ping with a freshly generated correlation id
    pub fn ping() -> Self {
        Self::new(PacketBody::Ping {
            id: generate_correlation_id(),
        })
    }

    pub fn pong(id: u64) -> Self {
        Self::new(PacketBody::Pong { id })
    }

    pub fn connection_killed(exit_code: i32) -> Self {
        Self::new(PacketBody::ConnectionKilled { exit_code })
    }

    /// Application packet. Opcodes below `FIRST_APPLICATION_OPCODE` are
    /// rejected when encoded.
    pub fn application(opcode: u8, fields: Vec<Value>) -> Self {
        Self::new(PacketBody::Application { opcode, fields })
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn body(&self) -> &PacketBody {
        &self.body
    }

    pub fn into_body(self) -> PacketBody {
        self.body
    }

    pub fn packet_type(&self) -> PacketType {
        match &self.body {
            PacketBody::Discovery => PacketType::Discovery,
            PacketBody::DiscoveryConfirm { .. } => PacketType::DiscoveryConfirm,
            PacketBody::Handshake => PacketType::Handshake,
            PacketBody::HandshakeConfirm => PacketType::HandshakeConfirm,
            PacketBody::HandshakeRefuse { .. } => PacketType::HandshakeRefuse,
            PacketBody::Ping { .. } => PacketType::Ping,
            PacketBody::Pong { .. } => PacketType::Pong,
            PacketBody::ConnectionKilled { .. } => PacketType::ConnectionKilled,
            PacketBody::Application { opcode, .. } => PacketType::Application(*opcode),
        }
    }

    /// Correlation id of traceable packets
    pub fn correlation_id(&self) -> Option<u64> {
        match self.body {
            PacketBody::Ping { id } | PacketBody::Pong { id } => Some(id),
            _ => None,
        }
    }

    /// Field values in schema order
    pub fn field_values(&self) -> Vec<Value> {
        match &self.body {
            PacketBody::Discovery | PacketBody::Handshake | PacketBody::HandshakeConfirm => {
                Vec::new()
            }
            PacketBody::DiscoveryConfirm { platform } => vec![Value::Str(platform.clone())],
            PacketBody::HandshakeRefuse { reason } => vec![Value::Str(reason.clone())],
            PacketBody::Ping { id } | PacketBody::Pong { id } => vec![Value::Long(*id as i64)],
            PacketBody::ConnectionKilled { exit_code } => vec![Value::Int(*exit_code)],
            PacketBody::Application { fields, .. } => fields.clone(),
        }
    }

    /// Write version, opcode and fields onto an empty buffer
    pub fn encode_into(&self, buf: &mut WireBuffer) -> Result<(), CodecError> {
        let packet_type = self.packet_type();
        if let PacketType::Application(opcode) = packet_type {
            if opcode < FIRST_APPLICATION_OPCODE {
                return Err(CodecError::ReservedOpcode(opcode));
            }
        }

        buf.put_version(self.version)?;
        buf.put_opcode(packet_type.opcode())?;

        let values = self.field_values();
        let schema = packet_type.schema();
        for (index, value) in values.iter().enumerate() {
            let unsigned = schema.get(index).map_or(false, |field| field.unsigned);
            buf.put(value, unsigned)?;
        }
        Ok(())
    }

    /// Decode a complete frame. Version and opcode come from the header,
    /// fields are read in schema order.
    pub fn decode(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        let version = buf.version().ok_or(CodecError::Truncated {
            needed: 1,
            position: 0,
            available: 0,
        })?;
        let opcode = buf.opcode().ok_or(CodecError::Truncated {
            needed: 1,
            position: 1,
            available: 0,
        })?;
        let packet_type = PacketType::from_opcode(opcode);

        if let PacketType::Application(opcode) = packet_type {
            let mut fields = Vec::new();
            while buf.has_remaining() {
                fields.push(buf.get_next()?);
            }
            return Ok(Self::with_version(
                version,
                PacketBody::Application { opcode, fields },
            ));
        }

        let mut values = Vec::with_capacity(packet_type.schema().len());
        for field in packet_type.schema() {
            let value = buf.get_next()?;
            if !field.accepts(value.kind()) {
                return Err(CodecError::FieldMismatch {
                    packet_type,
                    field: field.name,
                    expected: field.encoded_kind(),
                    found: value.kind(),
                });
            }
            values.push(value);
        }

        if buf.has_remaining() {
            return Err(CodecError::TrailingBytes {
                count: buf.remaining(),
                packet_type,
            });
        }

        let body = build_body(packet_type, values);
        Ok(Self::with_version(version, body))
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            PacketBody::DiscoveryConfirm { platform } => {
                write!(f, "{} (platform={})", self.packet_type(), platform)
            }
            PacketBody::HandshakeRefuse { reason } => {
                write!(f, "{} (reason={})", self.packet_type(), reason)
            }
            PacketBody::Ping { id } | PacketBody::Pong { id } => {
                write!(f, "{} (id={:#x})", self.packet_type(), id)
            }
            PacketBody::ConnectionKilled { exit_code } => {
                write!(f, "{} (exit_code={})", self.packet_type(), exit_code)
            }
            PacketBody::Application { fields, .. } => {
                write!(f, "{} ({} fields)", self.packet_type(), fields.len())
            }
            _ => write!(f, "{}", self.packet_type()),
        }
    }
}

/// Assemble a body from values already checked against the schema
fn build_body(packet_type: PacketType, values: Vec<Value>) -> PacketBody {
    let mut values = values.into_iter();
    let mut next = move || values.next().unwrap_or(Value::Nil);

    match packet_type {
        PacketType::Discovery => PacketBody::Discovery,
        PacketType::DiscoveryConfirm => PacketBody::DiscoveryConfirm {
            platform: string_field(next()),
        },
        PacketType::Handshake => PacketBody::Handshake,
        PacketType::HandshakeConfirm => PacketBody::HandshakeConfirm,
        PacketType::HandshakeRefuse => PacketBody::HandshakeRefuse {
            reason: string_field(next()),
        },
        PacketType::Ping => PacketBody::Ping {
            id: long_field(next()),
        },
        PacketType::Pong => PacketBody::Pong {
            id: long_field(next()),
        },
        PacketType::ConnectionKilled => PacketBody::ConnectionKilled {
            exit_code: long_field(next()) as i32,
        },
        PacketType::Application(opcode) => PacketBody::Application {
            opcode,
            fields: Vec::new(),
        },
    }
}

fn string_field(value: Value) -> String {
    match value {
        Value::Str(s) => s,
        _ => String::new(),
    }
}

fn long_field(value: Value) -> u64 {
    value.as_i64().map_or(0, |v| v as u64)
}

/// Correlation id for traceable packets: a nanosecond timestamp shifted
/// left 16 bits, mixed with 32 random bits.
pub fn generate_correlation_id() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let random = uuid::Uuid::new_v4().as_u128() as u32;
    (nanos << 16) ^ u64::from(random)
}
