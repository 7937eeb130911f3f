//! Property-based tests for the template-driven message codec.
//!
//! A kitchen-sink template exercises every field kind and block quota;
//! proptest fills it with arbitrary values and verifies that decode is the
//! inverse of encode, and that zerocoded and plain wire forms decode to
//! the same message.

// Strategy helpers run outside #[test] functions, where the clippy test
// allowances do not reach.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use metaverse_proto::{Message, MessageTemplate, Packet, PacketFlags};
use proptest::prelude::*;

const KITCHEN_SINK: &str = r"
{
	KitchenSink Low 9 NotTrusted Zerocoded
	{
		Scalars	Single
		{	A	U8	}
		{	B	U16	}
		{	C	U32	}
		{	D	U64	}
		{	E	S8	}
		{	F	S16	}
		{	G	S32	}
		{	H	F32	}
		{	I	F64	}
	}
	{
		Geometry	Multiple	2
		{	V3	LLVector3	}
		{	V4	LLVector4	}
		{	Q	LLQuaternion	}
		{	Id	LLUUID	}
	}
	{
		Strings	Variable
		{	Short	Variable	1	}
		{	Long	Variable	2	}
		{	Digest	Fixed	4	}
	}
}
";

fn kitchen_sink() -> MessageTemplate {
    MessageTemplate::parse(KITCHEN_SINK).expect("test template parses")
}

fn finite_f32() -> impl Strategy<Value = f32> {
    -1.0e30f32..1.0e30f32
}

fn vec3() -> impl Strategy<Value = [f32; 3]> {
    (finite_f32(), finite_f32(), finite_f32()).prop_map(|(x, y, z)| [x, y, z])
}

fn vec4() -> impl Strategy<Value = [f32; 4]> {
    (finite_f32(), finite_f32(), finite_f32(), finite_f32()).prop_map(|(x, y, z, w)| [x, y, z, w])
}

#[derive(Debug, Clone)]
struct StringsRow {
    short: Vec<u8>,
    long: Vec<u8>,
    digest: [u8; 4],
}

fn arbitrary_strings_row() -> impl Strategy<Value = StringsRow> {
    (
        prop::collection::vec(any::<u8>(), 0..255),
        prop::collection::vec(any::<u8>(), 0..1024),
        any::<[u8; 4]>(),
    )
        .prop_map(|(short, long, digest)| StringsRow { short, long, digest })
}

#[allow(clippy::type_complexity)]
fn arbitrary_message(template: &MessageTemplate) -> impl Strategy<Value = Message> {
    (
        (any::<u8>(), any::<u16>(), any::<u32>(), any::<u64>()),
        (any::<i8>(), any::<i16>(), any::<i32>(), finite_f32(), -1.0e100f64..1.0e100f64),
        prop::collection::vec((vec3(), vec4(), vec4(), any::<[u8; 16]>()), 2..=2),
        prop::collection::vec(arbitrary_strings_row(), 0..4),
    )
        .prop_map(move |((a, b, c, d), (e, f, g, h, i), geometry, strings)| {
            let mut msg = template.message("KitchenSink").expect("known message");
            msg.set("Scalars", "A", a).unwrap();
            msg.set("Scalars", "B", b).unwrap();
            msg.set("Scalars", "C", c).unwrap();
            msg.set("Scalars", "D", d).unwrap();
            msg.set("Scalars", "E", e).unwrap();
            msg.set("Scalars", "F", f).unwrap();
            msg.set("Scalars", "G", g).unwrap();
            msg.set("Scalars", "H", h).unwrap();
            msg.set("Scalars", "I", i).unwrap();
            for (row, (v3, v4, q, id)) in geometry.into_iter().enumerate() {
                msg.set_at("Geometry", row, "V3", v3).unwrap();
                msg.set_at("Geometry", row, "V4", v4).unwrap();
                msg.set_at("Geometry", row, "Q", metaverse_proto::FieldValue::Quaternion(q))
                    .unwrap();
                msg.set_at("Geometry", row, "Id", uuid::Uuid::from_bytes(id)).unwrap();
            }
            for row_data in strings {
                let row = msg.push_row("Strings").unwrap();
                msg.set_at("Strings", row, "Short", row_data.short).unwrap();
                msg.set_at("Strings", row, "Long", row_data.long).unwrap();
                msg.set_at("Strings", row, "Digest", row_data.digest.to_vec()).unwrap();
            }
            msg
        })
}

#[test]
fn prop_codec_round_trip() {
    let template = kitchen_sink();
    proptest!(|(msg in arbitrary_message(&template))| {
        let body = msg.encode().expect("should encode");
        let decoded = Message::decode(&template, &body).expect("should decode");
        prop_assert_eq!(decoded, msg);
    });
}

#[test]
fn prop_zerocoded_and_plain_wire_decode_identically() {
    let template = kitchen_sink();
    proptest!(|(msg in arbitrary_message(&template), sequence in 0u32..=metaverse_proto::SEQUENCE_MASK)| {
        let body = msg.encode().expect("should encode");

        let plain = Packet::new(PacketFlags::default(), sequence, body.clone());
        let coded = Packet::new(
            PacketFlags::default().with(PacketFlags::ZEROCODED),
            sequence,
            body,
        );

        let from_plain = Packet::decode(&plain.encode().expect("encode")).expect("decode");
        let from_coded = Packet::decode(&coded.encode().expect("encode")).expect("decode");

        let a = Message::decode(&template, &from_plain.body).expect("decode plain");
        let b = Message::decode(&template, &from_coded.body).expect("decode coded");
        prop_assert_eq!(a, b);
    });
}

#[test]
fn shared_template_messages_round_trip() {
    let template = MessageTemplate::shared();
    let mut msg = template.message("UseCircuitCode").expect("known message");
    let agent = uuid::Uuid::from_u128(0x1234_5678_9abc_def0_1234_5678_9abc_def0);
    let session = uuid::Uuid::from_u128(1);
    msg.set("CircuitCode", "Code", 0xDEAD_BEEFu32).unwrap();
    msg.set("CircuitCode", "SessionID", session).unwrap();
    msg.set("CircuitCode", "ID", agent).unwrap();

    let decoded = Message::decode(template, &msg.encode().unwrap()).unwrap();
    assert_eq!(decoded.name(), "UseCircuitCode");
    assert_eq!(decoded.get_u32("CircuitCode", "Code").unwrap(), 0xDEAD_BEEF);
    assert_eq!(decoded.get_uuid("CircuitCode", "ID").unwrap(), agent);
    assert_eq!(decoded.get_uuid("CircuitCode", "SessionID").unwrap(), session);
}
