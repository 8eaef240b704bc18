//! Binary wire codec: a versioned `ProtoHeader` wrapping a typed body, and for
//! data requests a `MessageHeader` followed by TLV fields and ops. Field and op
//! payloads are borrowed as `Bytes` slices of the connection's owned frame
//! buffer rather than copied, so a parsed `DataMessage` can move freely between
//! pipeline stages.

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

use ember_base::error::{Error, ErrorKind, Result};

pub const DIGEST_SIZE: usize = 20;
pub const PROTO_HEADER_SIZE: usize = 8;
pub const MESSAGE_HEADER_SIZE: usize = 22;
/// Hard cap on a single frame's body size.
pub const PROTO_SIZE_MAX: usize = 128 * 1024 * 1024;
pub const PROTOCOL_VERSION: u8 = 2;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum ProtoType {
    Info = 1,
    Security = 2,
    Message = 3,
    MessageCompressed = 4,
}

impl ProtoType {
    fn from_u8(raw: u8) -> Result<ProtoType> {
        match raw {
            1 => Ok(ProtoType::Info),
            2 => Ok(ProtoType::Security),
            3 => Ok(ProtoType::Message),
            4 => Ok(ProtoType::MessageCompressed),
            _ => Err(Error::Fatal(ErrorKind::FrameType)),
        }
    }
}

/// `version(1) | type(1) | size(6, big-endian) | body(size)`.
#[derive(Debug, Copy, Clone)]
pub struct ProtoHeader {
    pub version: u8,
    pub ty: ProtoType,
    pub size: usize,
}

impl ProtoHeader {
    /// Parses a header from the first `PROTO_HEADER_SIZE` bytes of `bytes`.
    /// `bytes` may be longer; only the header is consumed.
    pub fn parse(bytes: &[u8]) -> Result<ProtoHeader> {
        if bytes.len() < PROTO_HEADER_SIZE {
            return Err(Error::Fatal(ErrorKind::FrameTooSmall));
        }

        let version = bytes[0];
        let ty = ProtoType::from_u8(bytes[1])?;

        let mut size_buf = [0u8; 8];
        size_buf[2..8].copy_from_slice(&bytes[2..8]);
        let size = BigEndian::read_u64(&size_buf) as usize;

        // Version 0 is only tolerated for the security frame type, for backward compatibility.
        if version == 0 && ty != ProtoType::Security {
            return Err(Error::Fatal(ErrorKind::ProtocolVersion));
        }
        if version != 0 && version != PROTOCOL_VERSION {
            return Err(Error::Fatal(ErrorKind::ProtocolVersion));
        }
        if size == 0 {
            return Err(Error::Fatal(ErrorKind::FrameTooSmall));
        }
        if size > PROTO_SIZE_MAX {
            return Err(Error::Fatal(ErrorKind::FrameTooLarge));
        }

        Ok(ProtoHeader { version, ty, size })
    }

    pub fn write(&self, out: &mut [u8; PROTO_HEADER_SIZE]) {
        out[0] = self.version;
        out[1] = self.ty as u8;

        let mut size_buf = [0u8; 8];
        BigEndian::write_u64(&mut size_buf, self.size as u64);
        out[2..8].copy_from_slice(&size_buf[2..8]);
    }
}

bitflags! {
    pub struct Info1: u8 {
        const READ             = 0x01;
        const GET_ALL          = 0x02;
        const BATCH            = 0x08;
        const XDR              = 0x10;
        const NOBINDATA        = 0x20;
        const CONSISTENCY_ALL  = 0x40;
    }
}

bitflags! {
    pub struct Info2: u8 {
        const WRITE            = 0x01;
        const DELETE           = 0x02;
        const GENERATION       = 0x04;
        const GENERATION_GT    = 0x08;
        const DURABLE_DELETE   = 0x10;
        const CREATE_ONLY      = 0x20;
        const RESPOND_ALL_OPS  = 0x80;
    }
}

bitflags! {
    pub struct Info3: u8 {
        const LAST             = 0x01;
        const COMMIT_MASTER    = 0x02;
        const UPDATE_ONLY      = 0x08;
        const CREATE_OR_REPLACE = 0x10;
        const REPLACE_ONLY     = 0x20;
        const SC_READ_TYPE     = 0x40;
        const SC_READ_RELAX    = 0x80;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FieldType {
    Namespace,
    SetName,
    Key,
    Digest,
    TranId,
    ScanOptions,
    IndexName,
    IndexRange,
    IndexType,
    UdfPackageName,
    UdfFunction,
    UdfArgList,
    UdfOp,
    QueryBinList,
    BatchIndex,
    BatchIndexWithSet,
    Unknown(u8),
}

impl From<u8> for FieldType {
    fn from(raw: u8) -> FieldType {
        match raw {
            0 => FieldType::Namespace,
            1 => FieldType::SetName,
            2 => FieldType::Key,
            4 => FieldType::Digest,
            7 => FieldType::TranId,
            8 => FieldType::ScanOptions,
            21 => FieldType::IndexName,
            22 => FieldType::IndexRange,
            26 => FieldType::IndexType,
            30 => FieldType::UdfPackageName,
            31 => FieldType::UdfFunction,
            32 => FieldType::UdfArgList,
            33 => FieldType::UdfOp,
            40 => FieldType::QueryBinList,
            41 => FieldType::BatchIndex,
            42 => FieldType::BatchIndexWithSet,
            other => FieldType::Unknown(other),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpType {
    Read,
    Write,
    CdtRead,
    CdtModify,
    Delete,
    Unknown(u8),
}

impl From<u8> for OpType {
    fn from(raw: u8) -> OpType {
        match raw {
            1 => OpType::Read,
            2 => OpType::Write,
            3 => OpType::CdtRead,
            4 => OpType::CdtModify,
            10 => OpType::Delete,
            other => OpType::Unknown(other),
        }
    }
}

impl From<OpType> for u8 {
    fn from(op: OpType) -> u8 {
        match op {
            OpType::Read => 1,
            OpType::Write => 2,
            OpType::CdtRead => 3,
            OpType::CdtModify => 4,
            OpType::Delete => 10,
            OpType::Unknown(raw) => raw,
        }
    }
}

bitflags! {
    /// Tracks which recognized fields were present, so downstream stages never
    /// need to re-scan the field list.
    pub struct FieldPresence: u32 {
        const NAMESPACE        = 1 << 0;
        const SET              = 1 << 1;
        const KEY               = 1 << 2;
        const DIGEST            = 1 << 3;
        const TRAN_ID           = 1 << 4;
        const SCAN_OPTIONS      = 1 << 5;
        const INDEX_NAME        = 1 << 6;
        const INDEX_RANGE       = 1 << 7;
        const INDEX_TYPE        = 1 << 8;
        const UDF_PACKAGE       = 1 << 9;
        const UDF_FUNCTION      = 1 << 10;
        const UDF_ARGLIST       = 1 << 11;
        const UDF_OP            = 1 << 12;
        const QUERY_BINLIST     = 1 << 13;
        const BATCH             = 1 << 14;
        const BATCH_WITH_SET    = 1 << 15;
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    pub field_type: FieldType,
    pub value: Bytes,
}

#[derive(Debug, Clone)]
pub struct Op {
    pub op_type: OpType,
    pub particle_type: u8,
    pub name: Bytes,
    pub value: Bytes,
}

#[derive(Debug, Copy, Clone)]
pub struct MessageHeader {
    pub header_sz: u8,
    pub info1: Info1,
    pub info2: Info2,
    pub info3: Info3,
    pub unused: u8,
    pub result_code: u8,
    pub generation: u32,
    pub record_ttl: u32,
    /// Overloaded to carry `batch_index` in batch sub-replies (§9).
    pub transaction_ttl: u32,
    pub n_fields: u16,
    pub n_ops: u16,
}

#[derive(Debug, Clone)]
pub struct DataMessage {
    pub header: MessageHeader,
    pub fields: Vec<Field>,
    pub ops: Vec<Op>,
    pub field_presence: FieldPresence,
}

impl DataMessage {
    pub fn digest(&self) -> Option<&Bytes> {
        self.fields
            .iter()
            .find(|f| f.field_type == FieldType::Digest)
            .map(|f| &f.value)
    }

    pub fn namespace(&self) -> Option<&Bytes> {
        self.fields
            .iter()
            .find(|f| f.field_type == FieldType::Namespace)
            .map(|f| &f.value)
    }
}

fn presence_for(field_type: FieldType) -> FieldPresence {
    match field_type {
        FieldType::Namespace => FieldPresence::NAMESPACE,
        FieldType::SetName => FieldPresence::SET,
        FieldType::Key => FieldPresence::KEY,
        FieldType::Digest => FieldPresence::DIGEST,
        FieldType::TranId => FieldPresence::TRAN_ID,
        FieldType::ScanOptions => FieldPresence::SCAN_OPTIONS,
        FieldType::IndexName => FieldPresence::INDEX_NAME,
        FieldType::IndexRange => FieldPresence::INDEX_RANGE,
        FieldType::IndexType => FieldPresence::INDEX_TYPE,
        FieldType::UdfPackageName => FieldPresence::UDF_PACKAGE,
        FieldType::UdfFunction => FieldPresence::UDF_FUNCTION,
        FieldType::UdfArgList => FieldPresence::UDF_ARGLIST,
        FieldType::UdfOp => FieldPresence::UDF_OP,
        FieldType::QueryBinList => FieldPresence::QUERY_BINLIST,
        FieldType::BatchIndex => FieldPresence::BATCH,
        FieldType::BatchIndexWithSet => FieldPresence::BATCH_WITH_SET,
        FieldType::Unknown(_) => FieldPresence::empty(),
    }
}

/// Parses a data-message body (the bytes following the `ProtoHeader`) into a
/// `DataMessage`. `body` is cheaply cloned (ref-counted) into each field/op slice.
pub fn parse_data_message(body: &Bytes) -> Result<DataMessage> {
    if body.len() < MESSAGE_HEADER_SIZE {
        return Err(Error::Fatal(ErrorKind::FrameTooSmall));
    }

    let header_sz = body[0];
    let info1 = Info1::from_bits_truncate(body[1]);
    let info2 = Info2::from_bits_truncate(body[2]);
    let info3 = Info3::from_bits_truncate(body[3]);
    let unused = body[4];
    let result_code = body[5];
    let generation = BigEndian::read_u32(&body[6..10]);
    let record_ttl = BigEndian::read_u32(&body[10..14]);
    let transaction_ttl = BigEndian::read_u32(&body[14..18]);
    let n_fields = BigEndian::read_u16(&body[18..20]);
    let n_ops = BigEndian::read_u16(&body[20..22]);

    let header = MessageHeader {
        header_sz,
        info1,
        info2,
        info3,
        unused,
        result_code,
        generation,
        record_ttl,
        transaction_ttl,
        n_fields,
        n_ops,
    };

    let mut cursor = MESSAGE_HEADER_SIZE;
    let mut fields = Vec::with_capacity(n_fields as usize);
    let mut field_presence = FieldPresence::empty();

    for _ in 0..n_fields {
        if cursor + 4 > body.len() {
            return Err(Error::Fatal(ErrorKind::FieldOverrun));
        }

        // size includes the type byte but not the size field itself.
        let size = BigEndian::read_u32(&body[cursor..cursor + 4]) as usize;
        if size == 0 || cursor + 4 + size > body.len() {
            return Err(Error::Fatal(ErrorKind::FieldOverrun));
        }

        let type_byte = body[cursor + 4];
        let value = body.slice(cursor + 5..cursor + 4 + size);
        let field_type = FieldType::from(type_byte);

        field_presence |= presence_for(field_type);
        fields.push(Field { field_type, value });

        cursor += 4 + size;
    }

    let mut ops = Vec::with_capacity(n_ops as usize);
    for _ in 0..n_ops {
        if cursor + 4 > body.len() {
            return Err(Error::Fatal(ErrorKind::FieldOverrun));
        }

        // op_sz includes the 4 op-header bytes following it, but not itself.
        let op_sz = BigEndian::read_u32(&body[cursor..cursor + 4]) as usize;
        if op_sz < 4 || cursor + 4 + op_sz > body.len() {
            return Err(Error::Fatal(ErrorKind::FieldOverrun));
        }

        let op_type = OpType::from(body[cursor + 4]);
        let particle_type = body[cursor + 5];
        let _version = body[cursor + 6];
        let name_sz = body[cursor + 7] as usize;

        let name_start = cursor + 8;
        let name_end = name_start + name_sz;
        let op_end = cursor + 4 + op_sz;

        if name_end > op_end {
            return Err(Error::Fatal(ErrorKind::FieldOverrun));
        }

        let name = body.slice(name_start..name_end);
        let value = body.slice(name_end..op_end);

        ops.push(Op { op_type, particle_type, name, value });

        cursor = op_end;
    }

    // Trailing bytes past fields+ops are tolerated for legacy client compatibility.

    Ok(DataMessage { header, fields, ops, field_presence })
}

fn write_op(out: &mut Vec<u8>, op: &Op) {
    let op_sz = 4 + op.name.len() + op.value.len();
    let mut header = [0u8; 4];
    BigEndian::write_u32(&mut header, op_sz as u32);
    out.extend_from_slice(&header);
    out.push(op.op_type.into());
    out.push(op.particle_type);
    out.push(0); // version
    out.push(op.name.len() as u8);
    out.extend_from_slice(&op.name);
    out.extend_from_slice(&op.value);
}

/// Composes a single data-message reply frame (`ProtoHeader` + `MessageHeader` + ops),
/// with no fields. `batch_index`, when present, is carried in the `transaction_ttl`
/// slot per the documented overload used for batch sub-replies.
pub fn make_reply(result_code: u8, generation: u32, void_time: u32, ops: &[Op], batch_index: Option<u32>) -> Vec<u8> {
    let mut body = Vec::with_capacity(MESSAGE_HEADER_SIZE + ops.len() * 32);

    body.push(MESSAGE_HEADER_SIZE as u8);
    body.push(Info1::empty().bits());
    body.push(Info2::empty().bits());
    body.push(Info3::empty().bits());
    body.push(0);
    body.push(result_code);

    let mut buf4 = [0u8; 4];
    BigEndian::write_u32(&mut buf4, generation);
    body.extend_from_slice(&buf4);
    BigEndian::write_u32(&mut buf4, void_time);
    body.extend_from_slice(&buf4);
    BigEndian::write_u32(&mut buf4, batch_index.unwrap_or(0));
    body.extend_from_slice(&buf4);

    let mut buf2 = [0u8; 2];
    BigEndian::write_u16(&mut buf2, 0); // n_fields
    body.extend_from_slice(&buf2);
    BigEndian::write_u16(&mut buf2, ops.len() as u16);
    body.extend_from_slice(&buf2);

    for op in ops {
        write_op(&mut body, op);
    }

    let header = ProtoHeader { version: PROTOCOL_VERSION, ty: ProtoType::Message, size: body.len() };
    let mut out = Vec::with_capacity(PROTO_HEADER_SIZE + body.len());
    let mut header_bytes = [0u8; PROTO_HEADER_SIZE];
    header.write(&mut header_bytes);
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&body);
    out
}

/// Composes the minimal error reply used when a frame fails to parse into a
/// transaction at all: no fields, no ops, just a result code.
pub fn make_error_reply(result_code: u8) -> Vec<u8> {
    make_reply(result_code, 0, 0, &[], None)
}

/// Composes the batch trailer: `info3` LAST bit set, zero fields/ops, carrying
/// the batch-wide result code.
pub fn make_batch_trailer(result_code: u8) -> Vec<u8> {
    let mut reply = make_reply(result_code, 0, 0, &[], None);
    // info3 byte sits at body offset 3, body starts right after the 8-byte proto header.
    reply[PROTO_HEADER_SIZE + 3] = Info3::LAST.bits();
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_body(n_fields: u16, n_ops: u16) -> Vec<u8> {
        let mut body = vec![0u8; MESSAGE_HEADER_SIZE];
        body[0] = MESSAGE_HEADER_SIZE as u8;
        body[1] = Info1::READ.bits();
        BigEndian::write_u16(&mut body[18..20], n_fields);
        BigEndian::write_u16(&mut body[20..22], n_ops);

        // one namespace field: size(4) covers type+value
        let ns = b"test";
        let field_size = 1 + ns.len();
        let mut field_size_buf = [0u8; 4];
        BigEndian::write_u32(&mut field_size_buf, field_size as u32);
        body.extend_from_slice(&field_size_buf);
        body.push(0); // FieldType::Namespace
        body.extend_from_slice(ns);

        // one read op on bin "a"
        let name = b"a";
        let op_sz = 4 + name.len();
        let mut op_sz_buf = [0u8; 4];
        BigEndian::write_u32(&mut op_sz_buf, op_sz as u32);
        body.extend_from_slice(&op_sz_buf);
        body.push(1); // OpType::Read
        body.push(0); // particle type
        body.push(0); // version
        body.push(name.len() as u8);
        body.extend_from_slice(name);

        body
    }

    #[test]
    fn proto_header_roundtrips() {
        let header = ProtoHeader { version: PROTOCOL_VERSION, ty: ProtoType::Message, size: 1234 };
        let mut bytes = [0u8; PROTO_HEADER_SIZE];
        header.write(&mut bytes);

        let parsed = ProtoHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.version, PROTOCOL_VERSION);
        assert_eq!(parsed.ty, ProtoType::Message);
        assert_eq!(parsed.size, 1234);
    }

    #[test]
    fn proto_header_rejects_oversize() {
        let header = ProtoHeader { version: PROTOCOL_VERSION, ty: ProtoType::Message, size: PROTO_SIZE_MAX + 1 };
        let mut bytes = [0u8; PROTO_HEADER_SIZE];
        header.write(&mut bytes);
        assert!(ProtoHeader::parse(&bytes).is_err());
    }

    #[test]
    fn proto_header_zero_size_rejected() {
        let header = ProtoHeader { version: PROTOCOL_VERSION, ty: ProtoType::Message, size: 0 };
        let mut bytes = [0u8; PROTO_HEADER_SIZE];
        header.write(&mut bytes);
        assert!(ProtoHeader::parse(&bytes).is_err());
    }

    #[test]
    fn parses_namespace_field_and_read_op() {
        let body = Bytes::from(sample_body(1, 1));
        let msg = parse_data_message(&body).unwrap();

        assert_eq!(msg.header.n_fields, 1);
        assert_eq!(msg.header.n_ops, 1);
        assert_eq!(&msg.namespace().unwrap()[..], b"test");
        assert!(msg.field_presence.contains(FieldPresence::NAMESPACE));

        assert_eq!(msg.ops.len(), 1);
        assert_eq!(msg.ops[0].op_type, OpType::Read);
        assert_eq!(&msg.ops[0].name[..], b"a");
    }

    #[test]
    fn field_overrunning_body_is_rejected() {
        let mut body = sample_body(1, 0);
        // Corrupt the field size to claim more than is available.
        BigEndian::write_u32(&mut body[MESSAGE_HEADER_SIZE..MESSAGE_HEADER_SIZE + 4], 10_000);
        let body = Bytes::from(body);
        assert!(parse_data_message(&body).is_err());
    }

    #[test]
    fn unknown_field_type_parses_without_aborting() {
        let mut body = sample_body(1, 0);
        body[MESSAGE_HEADER_SIZE + 4] = 200; // unrecognized field type byte
        let body = Bytes::from(body);
        let msg = parse_data_message(&body).unwrap();
        assert!(matches!(msg.fields[0].field_type, FieldType::Unknown(200)));
    }

    #[test]
    fn make_reply_roundtrips_through_parse() {
        let op = Op { op_type: OpType::Read, particle_type: 0, name: Bytes::from_static(b"a"), value: Bytes::from_static(b"42") };
        let wire = make_reply(0, 7, 12345, &[op], None);

        let header = ProtoHeader::parse(&wire).unwrap();
        let body = Bytes::copy_from_slice(&wire[PROTO_HEADER_SIZE..PROTO_HEADER_SIZE + header.size]);
        let msg = parse_data_message(&body).unwrap();

        assert_eq!(msg.header.result_code, 0);
        assert_eq!(msg.header.generation, 7);
        assert_eq!(msg.header.record_ttl, 12345);
        assert_eq!(msg.header.n_ops, 1);
        assert_eq!(&msg.ops[0].value[..], b"42");
    }

    #[test]
    fn batch_trailer_has_last_bit_and_zero_counts() {
        let wire = make_batch_trailer(0);
        let header = ProtoHeader::parse(&wire).unwrap();
        let body = Bytes::copy_from_slice(&wire[PROTO_HEADER_SIZE..PROTO_HEADER_SIZE + header.size]);
        let msg = parse_data_message(&body).unwrap();

        assert!(msg.header.info3.contains(Info3::LAST));
        assert_eq!(msg.header.n_fields, 0);
        assert_eq!(msg.header.n_ops, 0);
    }

    #[test]
    fn batch_index_overload_roundtrips_in_transaction_ttl() {
        let wire = make_reply(0, 0, 0, &[], Some(42));
        let header = ProtoHeader::parse(&wire).unwrap();
        let body = Bytes::copy_from_slice(&wire[PROTO_HEADER_SIZE..PROTO_HEADER_SIZE + header.size]);
        let msg = parse_data_message(&body).unwrap();

        assert_eq!(msg.header.transaction_ttl, 42);
    }
}
