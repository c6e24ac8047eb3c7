//! 宿主值 → BSON 编码模块
//!
//! 按深度优先先序遍历宿主值，直接向缓冲区写出 BSON 元素。
//! 文档长度先写占位，容器结束后回填。

use crate::options::ConversionOptions;
use crate::spec::*;
use crate::value::{
    unmangle_property_name, Binary, ExtendedType, HostMap, HostValue, JavaScriptCode, Key,
    Serializable,
};
use crate::{EncodeError, EncodeResult};
use bytes::{BufMut, Bytes, BytesMut};
use compact_str::CompactString;
use docbridge_common::ObjectId;
use std::borrow::Cow;
use tracing::debug;

/// 一次编码调用的结果
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedDocument {
    /// 完整、自包含的 BSON 文档
    pub bytes: Bytes,
    /// 仅在请求返回且确实生成了 `_id` 时存在
    pub generated_id: Option<ObjectId>,
}

/// 编码宿主值为 BSON 文档
///
/// # Brief
/// 顶层值必须是 map、序列、对象或 Serializable；按 `options` 决定是否补全 `_id`
///
/// # Arguments
/// * `value` - 要编码的宿主值
/// * `options` - 转换选项
///
/// # Returns
/// 成功返回编码结果，遇到无法表示的值返回错误且不产生部分文档
pub fn encode(value: &HostValue, options: &ConversionOptions) -> EncodeResult<EncodedDocument> {
    let mut buf = BytesMut::with_capacity(256);
    let mut encoder = Encoder::new(&mut buf, TraversalContext::from_options(options), 0);
    encoder.encode_root(value)?;
    let generated_id = encoder.ctx.returned_id();
    Ok(EncodedDocument {
        bytes: buf.freeze(),
        generated_id,
    })
}

/// 编码宿主值为 `Vec<u8>`
pub fn encode_to_vec(value: &HostValue, options: &ConversionOptions) -> EncodeResult<Vec<u8>> {
    encode(value, options).map(|doc| doc.bytes.to_vec())
}

/// 遍历过程中可变的状态，与不可变的配置分开
#[derive(Debug, Default)]
struct TraversalContext {
    /// 找到 `_id` 后清除
    add_missing_id: bool,
    return_generated_id: bool,
    generated_id: Option<ObjectId>,
}

impl TraversalContext {
    fn from_options(options: &ConversionOptions) -> Self {
        Self {
            add_missing_id: options.add_missing_id,
            return_generated_id: options.return_generated_id,
            generated_id: None,
        }
    }

    fn returned_id(&self) -> Option<ObjectId> {
        if self.return_generated_id {
            self.generated_id
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerKind {
    Array,
    Document,
}

type Fields<'v> = Vec<(Cow<'v, str>, &'v HostValue)>;

struct Encoder<'a> {
    buf: &'a mut BytesMut,
    ctx: TraversalContext,
    depth: usize,
}

impl<'a> Encoder<'a> {
    fn new(buf: &'a mut BytesMut, ctx: TraversalContext, depth: usize) -> Self {
        Self { buf, ctx, depth }
    }

    fn encode_root(&mut self, value: &HostValue) -> EncodeResult<()> {
        match value {
            HostValue::Sequence(_) | HostValue::Map(_) | HostValue::Object(_) => {
                self.encode_container(None, value)
            }
            HostValue::Extended(ExtendedType::Serializable(s)) => {
                let substitute = serialize_substitute(s)?;
                self.encode_container(None, &substitute)
            }
            other => Err(EncodeError::UnsupportedType(format!(
                "top-level value must be a document or array, got {}",
                other.type_name()
            ))),
        }
    }

    /// 写出一个容器；`key` 为 `None` 时写出的是本编码器的顶层文档
    fn encode_container(&mut self, key: Option<&str>, value: &HostValue) -> EncodeResult<()> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(EncodeError::NestingTooDeep(MAX_NESTING_DEPTH));
        }
        let (kind, fields) = container_fields(value)?;

        if let Some(key) = key {
            let element_type = match kind {
                ContainerKind::Array => ElementType::Array,
                ContainerKind::Document => ElementType::EmbeddedDocument,
            };
            self.put_element_header(element_type, key)?;
        }

        let start = self.begin_document();
        self.depth += 1;
        for (name, child) in &fields {
            if key.is_none() && self.ctx.add_missing_id && name.as_ref() == ID_FIELD {
                self.ctx.add_missing_id = false;
            }
            self.encode_element(name, child)?;
        }
        self.depth -= 1;

        // 根容器被判定为数组时不补 `_id`，空容器按文档处理
        let root_is_document = kind == ContainerKind::Document || fields.is_empty();
        if key.is_none() && root_is_document && self.ctx.add_missing_id {
            let id = ObjectId::new();
            self.put_element_header(ElementType::ObjectId, ID_FIELD)?;
            self.buf.put_slice(id.as_bytes());
            debug!(id = %id, "generated missing _id");
            self.ctx.add_missing_id = false;
            self.ctx.generated_id = Some(id);
        }

        self.end_document(start)
    }

    fn encode_element(&mut self, key: &str, value: &HostValue) -> EncodeResult<()> {
        match value {
            HostValue::Null => {
                self.put_element_header(ElementType::Null, key)?;
            }
            HostValue::Bool(b) => {
                self.put_element_header(ElementType::Boolean, key)?;
                self.buf.put_u8(*b as u8);
            }
            HostValue::Int(n) => match i32::try_from(*n) {
                Ok(small) => {
                    self.put_element_header(ElementType::Int32, key)?;
                    self.buf.put_i32_le(small);
                }
                Err(_) => {
                    self.put_element_header(ElementType::Int64, key)?;
                    self.buf.put_i64_le(*n);
                }
            },
            HostValue::Float(f) => {
                self.put_element_header(ElementType::Double, key)?;
                self.buf.put_f64_le(*f);
            }
            HostValue::String(s) => {
                self.put_element_header(ElementType::String, key)?;
                self.put_string(s)?;
            }
            HostValue::Sequence(_) | HostValue::Map(_) | HostValue::Object(_) => {
                self.encode_container(Some(key), value)?;
            }
            HostValue::Extended(ext) => self.encode_extended(key, ext)?,
            HostValue::Resource(kind) => {
                return Err(EncodeError::UnsupportedType(format!(
                    "Got unsupported type 'resource' ({}) for field '{}'",
                    kind, key
                )));
            }
        }
        Ok(())
    }

    fn encode_extended(&mut self, key: &str, ext: &ExtendedType) -> EncodeResult<()> {
        match ext {
            ExtendedType::Binary(b) => self.encode_binary(key, b)?,
            ExtendedType::JavaScriptCode(js) => self.encode_javascript(key, js)?,
            ExtendedType::ObjectId(id) => {
                self.put_element_header(ElementType::ObjectId, key)?;
                self.buf.put_slice(id.as_bytes());
            }
            ExtendedType::Regex(r) => {
                self.put_element_header(ElementType::RegularExpression, key)?;
                self.put_cstring(&r.pattern, "regex pattern")?;
                self.put_cstring(&r.flags, "regex flags")?;
            }
            ExtendedType::Timestamp(ts) => {
                self.put_element_header(ElementType::Timestamp, key)?;
                self.buf.put_u32_le(ts.increment);
                self.buf.put_u32_le(ts.seconds);
            }
            ExtendedType::UtcDateTime(dt) => {
                self.put_element_header(ElementType::DateTime, key)?;
                self.buf.put_i64_le(dt.millis);
            }
            ExtendedType::MinKey => self.put_element_header(ElementType::MinKey, key)?,
            ExtendedType::MaxKey => self.put_element_header(ElementType::MaxKey, key)?,
            ExtendedType::Serializable(s) => {
                let substitute = serialize_substitute(s)?;
                self.encode_container(Some(key), &substitute)?;
            }
        }
        Ok(())
    }

    fn encode_binary(&mut self, key: &str, b: &Binary) -> EncodeResult<()> {
        let len = checked_len(b.bytes.len())?;
        self.put_element_header(ElementType::Binary, key)?;
        if b.subtype == BINARY_SUBTYPE_BINARY_OLD {
            let outer = len
                .checked_add(4)
                .ok_or(EncodeError::DocumentTooLarge(MAX_DOCUMENT_SIZE))?;
            self.buf.put_i32_le(outer);
            self.buf.put_u8(b.subtype);
            self.buf.put_i32_le(len);
        } else {
            self.buf.put_i32_le(len);
            self.buf.put_u8(b.subtype);
        }
        self.buf.put_slice(&b.bytes);
        Ok(())
    }

    fn encode_javascript(&mut self, key: &str, js: &JavaScriptCode) -> EncodeResult<()> {
        let scope = js.scope.as_deref().filter(|scope| {
            matches!(
                scope,
                HostValue::Map(_) | HostValue::Sequence(_) | HostValue::Object(_)
            )
        });
        let Some(scope) = scope else {
            self.put_element_header(ElementType::JavaScriptCode, key)?;
            return self.put_string(&js.code);
        };

        self.put_element_header(ElementType::JavaScriptCodeWithScope, key)?;
        let start = self.buf.len();
        self.buf.put_i32_le(0);
        self.put_string(&js.code)?;
        {
            // scope 是独立的文档，不继承 `_id` 相关的标志；
            // 与普通子文档一样只占一层嵌套
            let mut nested = Encoder::new(&mut *self.buf, TraversalContext::default(), self.depth);
            nested.encode_container(None, scope)?;
        }
        self.backpatch_length(start)
    }

    fn begin_document(&mut self) -> usize {
        let start = self.buf.len();
        self.buf.put_i32_le(0);
        start
    }

    fn end_document(&mut self, start: usize) -> EncodeResult<()> {
        self.buf.put_u8(0);
        self.backpatch_length(start)
    }

    fn backpatch_length(&mut self, start: usize) -> EncodeResult<()> {
        let len = checked_len(self.buf.len() - start)?;
        self.buf[start..start + 4].copy_from_slice(&len.to_le_bytes());
        Ok(())
    }

    fn put_element_header(&mut self, element_type: ElementType, key: &str) -> EncodeResult<()> {
        self.buf.put_u8(element_type as u8);
        self.put_cstring(key, "field name")
    }

    fn put_cstring(&mut self, s: &str, what: &str) -> EncodeResult<()> {
        if s.as_bytes().contains(&0) {
            return Err(EncodeError::UnsupportedType(format!(
                "{} contains a NUL byte: {:?}",
                what, s
            )));
        }
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
        Ok(())
    }

    /// 显式长度，允许内嵌 NUL
    fn put_string(&mut self, s: &str) -> EncodeResult<()> {
        let len = checked_len(s.len() + 1)?;
        self.buf.put_i32_le(len);
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
        Ok(())
    }
}

fn checked_len(len: usize) -> EncodeResult<i32> {
    i32::try_from(len).map_err(|_| EncodeError::DocumentTooLarge(MAX_DOCUMENT_SIZE))
}

/// 判断容器的写出方式并给出逻辑字段名
///
/// 序列总是数组；map 仅当键按遍历顺序恰为 0..n-1 时是数组；
/// 对象总是文档，且属性名需要去掉可见性标记。
fn container_fields(value: &HostValue) -> EncodeResult<(ContainerKind, Fields<'_>)> {
    match value {
        HostValue::Sequence(items) => Ok((
            ContainerKind::Array,
            items
                .iter()
                .enumerate()
                .map(|(i, v)| (Cow::Owned(i.to_string()), v))
                .collect(),
        )),
        HostValue::Map(map) if is_packed(map) => Ok((
            ContainerKind::Array,
            map.values()
                .enumerate()
                .map(|(i, v)| (Cow::Owned(i.to_string()), v))
                .collect(),
        )),
        HostValue::Map(map) => {
            let mut fields = Fields::with_capacity(map.len());
            for (k, v) in map {
                let name = match k {
                    Key::Index(i) => Cow::Owned(i.to_string()),
                    Key::Name(s) if s.starts_with('\0') => {
                        return Err(EncodeError::UnsupportedType(format!(
                            "map key {:?} starts with the reserved property marker",
                            s.as_str()
                        )));
                    }
                    Key::Name(s) => Cow::Borrowed(s.as_str()),
                };
                fields.push((name, v));
            }
            Ok((ContainerKind::Document, fields))
        }
        HostValue::Object(obj) => {
            let mut fields = Fields::with_capacity(obj.properties.len());
            for (k, v) in &obj.properties {
                let name = unmangle_property_name(k).ok_or_else(|| {
                    EncodeError::UnsupportedType(format!(
                        "malformed property name {:?} on {}",
                        k.as_str(),
                        obj.class_name
                    ))
                })?;
                fields.push((Cow::Borrowed(name), v));
            }
            Ok((ContainerKind::Document, fields))
        }
        other => Err(EncodeError::UnsupportedType(format!(
            "{} is not a container",
            other.type_name()
        ))),
    }
}

/// 键按遍历顺序是否为连续整数 0, 1, ..., n-1
fn is_packed(map: &HostMap) -> bool {
    map.keys()
        .enumerate()
        .all(|(i, k)| matches!(k, Key::Index(n) if *n == i as i64))
}

/// 调用 Serializable 回调得到替代文档
///
/// 回调必须返回 map 或序列；Persistable 值额外写入 `__pclass` 类型名字段。
fn serialize_substitute(s: &Serializable) -> EncodeResult<HostValue> {
    let produced = s.produce().map_err(|e| EncodeError::Callback {
        type_name: s.type_name().to_string(),
        message: e.to_string(),
    })?;

    let mut map = match produced {
        HostValue::Map(map) => map,
        HostValue::Sequence(items) if !s.is_persistable() => return Ok(HostValue::Sequence(items)),
        HostValue::Sequence(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, v)| (Key::Index(i as i64), v))
            .collect(),
        other => {
            return Err(EncodeError::Callback {
                type_name: s.type_name().to_string(),
                message: format!(
                    "Expected bsonSerialize() to return a map or sequence, but {} given",
                    other.type_name()
                ),
            });
        }
    };

    if s.is_persistable() {
        map.insert(
            Key::Name(CompactString::new(PERSISTABLE_CLASS_FIELD)),
            HostValue::String(CompactString::new(s.type_name())),
        );
    }
    Ok(HostValue::Map(map))
}
