//! BSON → 宿主值解码模块
//!
//! 每个文档字节区间由一个独立的 [`Decoder`] 处理：逐个读取元素，
//! 按元素类型转换后追加到累加器。嵌套文档与数组交给新的解码器实例。

use crate::options::{ArrayType, ConversionOptions, DocumentType};
use crate::reader::{DocumentReader, RawDocument, RawElement};
use crate::spec::MAX_NESTING_DEPTH;
use crate::value::{
    Binary, ExtendedType, HostMap, HostObject, HostValue, JavaScriptCode, Key, PropertyMap, Regex,
    Timestamp, UtcDateTime,
};
use crate::{DecodeError, DecodeResult};
use compact_str::CompactString;
use docbridge_common::ObjectId;
use tracing::{trace, warn};

/// 解码 BSON 字节为宿主值
///
/// # Brief
/// 缓冲区可以包含多个拼接的文档，返回最后一个文档的结果；
/// 任一文档损坏都会使整个调用失败
///
/// # Arguments
/// * `bytes` - BSON 字节
/// * `options` - 转换选项，决定文档与数组的形态
///
/// # Returns
/// 成功返回宿主值，损坏时返回 `CorruptDocument`
pub fn decode(bytes: &[u8], options: &ConversionOptions) -> DecodeResult<HostValue> {
    let mut last = None;
    for fields in Decoder::new(bytes, *options, 0).documents() {
        last = Some(fields?);
    }
    let fields = last.ok_or_else(|| {
        warn!("could not read document from reader");
        DecodeError::CorruptDocument("no document in input".to_string())
    })?;
    Ok(fields.into_document(options.root_document_type))
}

/// 解码缓冲区中的全部文档
pub fn decode_all(bytes: &[u8], options: &ConversionOptions) -> DecodeResult<Vec<HostValue>> {
    Decoder::new(bytes, *options, 0)
        .documents()
        .map(|fields| fields.map(|f| f.into_document(options.root_document_type)))
        .collect()
}

/// 单个文档的字段累加器
///
/// 保留全部字段（包括重复键），转换为 map 时后出现的值覆盖先出现的值。
#[derive(Debug, Default)]
pub struct Accumulator {
    fields: Vec<(CompactString, HostValue)>,
}

impl Accumulator {
    pub fn append(&mut self, key: &str, value: HostValue) {
        self.fields.push((CompactString::new(key), value));
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn into_document(self, shape: DocumentType) -> HostValue {
        match shape {
            DocumentType::OrderedMap => HostValue::Map(
                self.fields
                    .into_iter()
                    .map(|(k, v)| (Key::Name(k), v))
                    .collect::<HostMap>(),
            ),
            DocumentType::Object => HostValue::Object(HostObject::std_class(self.into_properties())),
        }
    }

    pub fn into_array(self, shape: ArrayType) -> HostValue {
        match shape {
            ArrayType::Sequence => {
                HostValue::Sequence(self.fields.into_iter().map(|(_, v)| v).collect())
            }
            ArrayType::Object => HostValue::Object(HostObject::std_class(self.into_properties())),
        }
    }

    fn into_properties(self) -> PropertyMap {
        self.fields.into_iter().collect()
    }
}

/// 绑定到一个字节区间的解码器
pub struct Decoder<'a> {
    bytes: &'a [u8],
    options: ConversionOptions,
    depth: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8], options: ConversionOptions, depth: usize) -> Self {
        Self {
            bytes,
            options,
            depth,
        }
    }

    /// 依次解码区间内的每个文档
    pub fn documents(self) -> impl Iterator<Item = DecodeResult<Accumulator>> + 'a {
        DocumentReader::new(self.bytes).map(move |doc| {
            let doc = doc.map_err(report_corrupt)?;
            self.visit_all(doc)
        })
    }

    fn visit_all(&self, doc: RawDocument<'a>) -> DecodeResult<Accumulator> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(DecodeError::NestingTooDeep(MAX_NESTING_DEPTH));
        }
        let mut acc = Accumulator::default();
        for element in doc {
            let (key, element) = element.map_err(report_corrupt)?;
            self.visit(key, element, &mut acc)?;
        }
        Ok(acc)
    }

    fn visit(&self, key: &str, element: RawElement<'a>, acc: &mut Accumulator) -> DecodeResult<()> {
        let value = match element {
            RawElement::Double(f) => HostValue::Float(f),
            RawElement::String(s) => HostValue::String(CompactString::new(s)),
            RawElement::Document(doc) => self
                .nested(doc)?
                .into_document(self.options.root_document_type),
            RawElement::Array(doc) => self.nested(doc)?.into_array(self.options.root_array_type),
            RawElement::Binary { subtype, bytes } => Binary::new(subtype, bytes).into(),
            RawElement::ObjectId(bytes) => ObjectId::from_bytes(bytes).into(),
            RawElement::Boolean(b) => HostValue::Bool(b),
            RawElement::DateTime(millis) => UtcDateTime::from_millis(millis).into(),
            RawElement::Null => HostValue::Null,
            RawElement::Regex { pattern, flags } => Regex::new(pattern, flags).into(),
            RawElement::JavaScriptCode(code) => JavaScriptCode::new(code).into(),
            RawElement::JavaScriptCodeWithScope { code, scope } => {
                let scope = self
                    .nested(scope)?
                    .into_document(self.options.root_document_type);
                JavaScriptCode::with_scope(code, scope).into()
            }
            RawElement::Int32(n) => HostValue::Int(n as i64),
            RawElement::Timestamp { seconds, increment } => {
                Timestamp { seconds, increment }.into()
            }
            RawElement::Int64(n) => HostValue::Int(n),
            RawElement::MaxKey => ExtendedType::MaxKey.into(),
            RawElement::MinKey => ExtendedType::MinKey.into(),
            RawElement::Skipped(element_type) => {
                trace!(key, ?element_type, "skipping unsupported element");
                return Ok(());
            }
        };
        acc.append(key, value);
        Ok(())
    }

    fn nested(&self, doc: RawDocument<'a>) -> DecodeResult<Accumulator> {
        Decoder::new(doc.as_bytes(), self.options, self.depth + 1).visit_all(doc)
    }
}

fn report_corrupt(e: DecodeError) -> DecodeError {
    if let DecodeError::CorruptDocument(reason) = &e {
        warn!(%reason, "converting corrupt document");
    }
    e
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::encode_to_vec;
    use crate::host;
    use crate::spec::ElementType;
    use proptest::prelude::*;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .try_init();
    }

    fn maps() -> ConversionOptions {
        ConversionOptions::default()
    }

    fn round_trip(value: &HostValue) -> HostValue {
        let bytes = encode_to_vec(value, &maps()).unwrap();
        decode(&bytes, &maps()).unwrap()
    }

    fn raw_doc(body: &[u8]) -> Vec<u8> {
        let mut out = ((body.len() + 5) as i32).to_le_bytes().to_vec();
        out.extend_from_slice(body);
        out.push(0);
        out
    }

    #[test]
    fn test_round_trip_scalars() {
        let value = host!({
            "null": null,
            "t": true,
            "f": false,
            "small": 42,
            "big": (1_i64 << 40),
            "neg": (-(1_i64 << 40)),
            "pi": 3.25,
            "s": "héllo \u{1F600}",
            "nul": "a\0b"
        });
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn test_round_trip_nested() {
        let value = host!({
            "list": [1, [2, 3], { "k": "v" }],
            "doc": { "inner": { "deep": [] } }
        });
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn test_extended_type_fidelity() {
        let value = host!({
            "bin": (Binary::new(0, vec![1, 2, 3])),
            "re": (Regex::new("^a+$", "i")),
            "ts": (Timestamp { seconds: 100, increment: 2 }),
            "dt": (UtcDateTime::from_millis(1_700_000_000_000)),
            "min": (ExtendedType::MinKey),
            "max": (ExtendedType::MaxKey),
            "oid": (ObjectId::from_bytes([7; 12])),
            "code": (JavaScriptCode::new("return 1;\0"))
        });
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn test_timestamp_fields_are_unsigned() {
        let value = host!({ "ts": (Timestamp { seconds: u32::MAX, increment: u32::MAX - 1 }) });
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn test_code_with_scope_round_trip() {
        let value = host!({ "f": (JavaScriptCode::with_scope("return x;", host!({ "x": 1 }))) });
        let decoded = round_trip(&value);
        match decoded.get("f").and_then(|v| v.as_extended()) {
            Some(ExtendedType::JavaScriptCode(js)) => {
                assert_eq!(js.code, "return x;");
                assert_eq!(js.scope.as_deref(), Some(&host!({ "x": 1 })));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_object_shaped_documents_at_every_level() {
        let bytes = encode_to_vec(&host!({ "a": { "b": { "c": 1 } }, "l": [1, 2] }), &maps()).unwrap();
        let decoded = decode(&bytes, &ConversionOptions::debug()).unwrap();

        let root = decoded.as_object().unwrap();
        assert_eq!(root.class_name, HostObject::STD_CLASS);
        let a = root.get("a").and_then(|v| v.as_object()).unwrap();
        let b = a.get("b").and_then(|v| v.as_object()).unwrap();
        assert_eq!(b.get("c"), Some(&HostValue::Int(1)));
        assert_eq!(
            root.get("l"),
            Some(&HostValue::Sequence(vec![HostValue::Int(1), HostValue::Int(2)]))
        );
    }

    #[test]
    fn test_object_shaped_arrays() {
        let bytes = encode_to_vec(&host!({ "l": ["x", "y"] }), &maps()).unwrap();
        let options = maps().with_array_type(ArrayType::Object);
        let decoded = decode(&bytes, &options).unwrap();
        let list = decoded.get("l").and_then(|v| v.as_object()).unwrap();
        assert_eq!(list.properties.keys().map(|k| k.as_str()).collect::<Vec<_>>(), vec!["0", "1"]);
        assert_eq!(list.get("1").and_then(|v| v.as_str()), Some("y"));
    }

    #[test]
    fn test_decodes_bson_crate_output() {
        let source = bson::doc! {
            "name": "x",
            "n": 5_i64,
            "arr": [1, "two", { "three": 3.0 }],
            "oid": bson::oid::ObjectId::from_bytes([3; 12]),
            "scope": bson::Bson::JavaScriptCodeWithScope(bson::JavaScriptCodeWithScope {
                code: "x".to_string(),
                scope: bson::doc! { "y": true },
            }),
        };
        let mut bytes = Vec::new();
        source.to_writer(&mut bytes).unwrap();

        let decoded = decode(&bytes, &maps()).unwrap();
        let expected = host!({
            "name": "x",
            "n": 5,
            "arr": [1, "two", { "three": 3.0 }],
            "oid": (ObjectId::from_bytes([3; 12])),
            "scope": (JavaScriptCode::with_scope("x", host!({ "y": true })))
        });
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_unknown_element_is_skipped() {
        init_tracing();
        let mut body = vec![ElementType::Int32 as u8, b'a', 0];
        body.extend_from_slice(&1i32.to_le_bytes());
        body.extend_from_slice(&[ElementType::Symbol as u8, b's', 0]);
        body.extend_from_slice(&4i32.to_le_bytes());
        body.extend_from_slice(b"sym\0");
        body.extend_from_slice(&[ElementType::Undefined as u8, b'u', 0]);
        let bytes = raw_doc(&body);

        assert_eq!(decode(&bytes, &maps()).unwrap(), host!({ "a": 1 }));
    }

    #[test]
    fn test_decimal128_is_skipped() {
        let mut body = vec![ElementType::Decimal128 as u8, b'd', 0];
        body.extend_from_slice(&[0u8; 16]);
        body.extend_from_slice(&[ElementType::Null as u8, b'n', 0]);
        assert_eq!(decode(&raw_doc(&body), &maps()).unwrap(), host!({ "n": null }));
    }

    #[test]
    fn test_truncated_input_is_corrupt() {
        init_tracing();
        let bytes = encode_to_vec(&host!({ "a": "hello", "b": [1, 2] }), &maps()).unwrap();
        for len in 0..bytes.len() {
            assert!(
                matches!(decode(&bytes[..len], &maps()), Err(DecodeError::CorruptDocument(_))),
                "prefix of {} bytes decoded",
                len
            );
        }
    }

    #[test]
    fn test_invalid_tag_is_corrupt() {
        let bytes = raw_doc(&[0x42, b'k', 0]);
        assert!(matches!(
            decode(&bytes, &maps()),
            Err(DecodeError::CorruptDocument(_))
        ));
    }

    #[test]
    fn test_corrupt_nested_document_fails_whole_decode() {
        let mut inner = raw_doc(&[0x08, b'b', 0, 7]);
        let mut body = vec![ElementType::EmbeddedDocument as u8, b'd', 0];
        body.append(&mut inner);
        assert!(matches!(
            decode(&raw_doc(&body), &maps()),
            Err(DecodeError::CorruptDocument(_))
        ));
    }

    #[test]
    fn test_multiple_documents() {
        let mut bytes = encode_to_vec(&host!({ "n": 1 }), &maps()).unwrap();
        bytes.extend(encode_to_vec(&host!({ "n": 2 }), &maps()).unwrap());

        assert_eq!(decode(&bytes, &maps()).unwrap(), host!({ "n": 2 }));
        assert_eq!(
            decode_all(&bytes, &maps()).unwrap(),
            vec![host!({ "n": 1 }), host!({ "n": 2 })]
        );

        bytes.extend_from_slice(&[0xFF, 0, 0]);
        assert!(decode(&bytes, &maps()).is_err());
        assert!(decode_all(&bytes, &maps()).is_err());
    }

    #[test]
    fn test_duplicate_keys_in_array_are_kept() {
        let mut body = vec![ElementType::Int32 as u8, b'0', 0];
        body.extend_from_slice(&1i32.to_le_bytes());
        body.extend_from_slice(&[ElementType::Int32 as u8, b'0', 0]);
        body.extend_from_slice(&2i32.to_le_bytes());
        let array = raw_doc(&body);
        let mut outer = vec![ElementType::Array as u8, b'l', 0];
        outer.extend(array);

        let decoded = decode(&raw_doc(&outer), &maps()).unwrap();
        assert_eq!(decoded, host!({ "l": [1, 2] }));
    }

    #[test]
    fn test_nesting_limit() {
        let mut bytes = raw_doc(&[]);
        for _ in 0..MAX_NESTING_DEPTH + 1 {
            let mut body = vec![ElementType::EmbeddedDocument as u8, b'n', 0];
            body.extend(bytes);
            bytes = raw_doc(&body);
        }
        assert_eq!(
            decode(&bytes, &maps()),
            Err(DecodeError::NestingTooDeep(MAX_NESTING_DEPTH))
        );
    }

    /// 由 `containers` 层 map 组成的链，最内层为 `{ "leaf": 1 }`
    fn map_chain(containers: usize) -> HostValue {
        let mut value = host!({ "leaf": 1 });
        for _ in 1..containers {
            value = host!({ "n": (value) });
        }
        value
    }

    fn bson_chain(containers: usize) -> bson::Document {
        let mut doc = bson::doc! { "leaf": 1 };
        for _ in 1..containers {
            doc = bson::doc! { "n": doc };
        }
        doc
    }

    fn code_with_scope_bytes(scope_containers: usize) -> Vec<u8> {
        let source = bson::doc! {
            "f": bson::Bson::JavaScriptCodeWithScope(bson::JavaScriptCodeWithScope {
                code: "x".to_string(),
                scope: bson_chain(scope_containers),
            }),
        };
        let mut bytes = Vec::new();
        source.to_writer(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn test_scope_counts_as_one_nesting_level() {
        // 根文档占一层，scope 及其内部的 map 占其余各层
        let deepest = MAX_NESTING_DEPTH - 1;
        let value = host!({ "f": (JavaScriptCode::with_scope("x", map_chain(deepest))) });

        let ours = encode_to_vec(&value, &maps()).unwrap();
        assert_eq!(decode(&ours, &maps()).unwrap(), value);

        let decoded = decode(&code_with_scope_bytes(deepest), &maps()).unwrap();
        assert_eq!(decoded, value);
        assert!(encode_to_vec(&decoded, &maps()).is_ok());

        let too_deep =
            host!({ "f": (JavaScriptCode::with_scope("x", map_chain(deepest + 1))) });
        assert!(matches!(
            encode_to_vec(&too_deep, &maps()),
            Err(crate::EncodeError::NestingTooDeep(MAX_NESTING_DEPTH))
        ));
        assert_eq!(
            decode(&code_with_scope_bytes(deepest + 1), &maps()),
            Err(DecodeError::NestingTooDeep(MAX_NESTING_DEPTH))
        );
    }

    #[test]
    fn test_plain_and_scoped_nesting_limits_agree() {
        let plain = host!({ "f": (map_chain(MAX_NESTING_DEPTH - 1)) });
        let scoped =
            host!({ "f": (JavaScriptCode::with_scope("x", map_chain(MAX_NESTING_DEPTH - 1))) });
        assert!(encode_to_vec(&plain, &maps()).is_ok());
        assert!(encode_to_vec(&scoped, &maps()).is_ok());
    }

    #[test]
    fn test_empty_input_is_corrupt() {
        assert!(matches!(decode(&[], &maps()), Err(DecodeError::CorruptDocument(_))));
        assert_eq!(decode_all(&[], &maps()).unwrap(), Vec::<HostValue>::new());
    }

    fn arb_key() -> impl Strategy<Value = String> {
        "[a-z_]{1,8}"
    }

    fn arb_host_value() -> impl Strategy<Value = HostValue> {
        let leaf = prop_oneof![
            Just(HostValue::Null),
            any::<bool>().prop_map(HostValue::Bool),
            any::<i32>().prop_map(|n| HostValue::Int(n as i64)),
            any::<i64>().prop_map(HostValue::Int),
            (-1.0e12f64..1.0e12).prop_map(HostValue::Float),
            "[a-zA-Z0-9 \\x00é漢]{0,16}".prop_map(HostValue::from),
        ];
        leaf.prop_recursive(4, 48, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(HostValue::Sequence),
                prop::collection::vec((arb_key(), inner), 1..6).prop_map(|entries| {
                    HostValue::Map(
                        entries
                            .into_iter()
                            .map(|(k, v)| (Key::from(k), v))
                            .collect(),
                    )
                }),
            ]
        })
    }

    fn arb_document() -> impl Strategy<Value = HostValue> {
        prop::collection::vec((arb_key(), arb_host_value()), 1..8).prop_map(|entries| {
            HostValue::Map(entries.into_iter().map(|(k, v)| (Key::from(k), v)).collect())
        })
    }

    /// 对象形态的解码结果折回 map，便于与原值比较
    fn objects_to_maps(value: HostValue) -> HostValue {
        match value {
            HostValue::Object(obj) => HostValue::Map(
                obj.properties
                    .into_iter()
                    .map(|(k, v)| (Key::Name(k), objects_to_maps(v)))
                    .collect(),
            ),
            HostValue::Map(map) => HostValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, objects_to_maps(v)))
                    .collect(),
            ),
            HostValue::Sequence(items) => {
                HostValue::Sequence(items.into_iter().map(objects_to_maps).collect())
            }
            other => other,
        }
    }

    proptest! {
        #[test]
        fn prop_round_trip(value in arb_document()) {
            let bytes = encode_to_vec(&value, &maps()).unwrap();
            prop_assert_eq!(decode(&bytes, &maps()).unwrap(), value);
        }

        #[test]
        fn prop_round_trip_object_shaped(value in arb_document()) {
            let bytes = encode_to_vec(&value, &maps()).unwrap();
            let decoded = decode(&bytes, &ConversionOptions::debug()).unwrap();
            let root = decoded.as_object().unwrap();
            prop_assert_eq!(root.class_name.as_str(), HostObject::STD_CLASS);
            prop_assert_eq!(objects_to_maps(decoded), value);
        }

        #[test]
        fn prop_truncation_never_panics(value in arb_document(), cut in any::<prop::sample::Index>()) {
            let bytes = encode_to_vec(&value, &maps()).unwrap();
            let len = cut.index(bytes.len());
            prop_assert!(decode(&bytes[..len], &maps()).is_err());
        }
    }
}
