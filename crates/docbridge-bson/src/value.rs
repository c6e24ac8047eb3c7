//! 宿主值类型定义模块
//!
//! 定义编码器的输入与解码器的输出：一个动态类型的值图，
//! 由标量、有序 map、序列、对象形态的值以及 BSON 扩展类型组成。

use chrono::{DateTime, TimeZone, Utc};
use compact_str::CompactString;
use docbridge_common::ObjectId;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// 有序 map，键为整数下标或字符串
pub type HostMap = IndexMap<Key, HostValue>;

/// 对象属性表，键为（可能带可见性标记的）属性名
pub type PropertyMap = IndexMap<CompactString, HostValue>;

/// Serializable 回调的失败类型
pub type CallbackFailure = Box<dyn std::error::Error + Send + Sync>;

/// 宿主值的枚举类型
///
/// # 支持的类型
///
/// - **标量**: Null, Bool, Int, Float, String
/// - **容器**: Sequence, Map, Object
/// - **扩展类型**: Binary, JavaScriptCode, ObjectId, Regex, Timestamp, UtcDateTime,
///   MinKey, MaxKey, Serializable
/// - **不透明句柄**: Resource（没有 BSON 表示，编码时报错）
#[derive(Debug, Clone, PartialEq, Default)]
pub enum HostValue {
    /// 空值
    #[default]
    Null,
    /// 布尔值
    Bool(bool),
    /// 64位有符号整数
    Int(i64),
    /// 64位浮点数
    Float(f64),
    /// UTF-8 字符串（可包含 NUL 字节）
    String(CompactString),
    /// 值序列
    Sequence(Vec<HostValue>),
    /// 有序 map
    Map(HostMap),
    /// 对象形态的值
    Object(HostObject),
    /// BSON 扩展类型
    Extended(ExtendedType),
    /// 不透明的宿主资源句柄
    Resource(CompactString),
}

/// map 的键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Index(i64),
    Name(CompactString),
}

/// 对象形态的值
///
/// 属性名可能带有可见性标记：受保护属性为 `"\0*\0name"`，
/// 私有属性为 `"\0Class\0name"`。编码时会去掉这些标记。
#[derive(Debug, Clone, PartialEq)]
pub struct HostObject {
    pub class_name: CompactString,
    pub properties: PropertyMap,
}

/// BSON 扩展类型
#[derive(Debug, Clone, PartialEq)]
pub enum ExtendedType {
    Binary(Binary),
    JavaScriptCode(JavaScriptCode),
    ObjectId(ObjectId),
    Regex(Regex),
    Timestamp(Timestamp),
    UtcDateTime(UtcDateTime),
    MinKey,
    MaxKey,
    Serializable(Serializable),
}

/// 二进制数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    pub subtype: u8,
    pub bytes: Vec<u8>,
}

/// JavaScript 代码，可带作用域文档
#[derive(Debug, Clone, PartialEq)]
pub struct JavaScriptCode {
    pub code: CompactString,
    pub scope: Option<Box<HostValue>>,
}

/// 正则表达式
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Regex {
    pub pattern: CompactString,
    pub flags: CompactString,
}

/// 复制集内部使用的时间戳
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub seconds: u32,
    pub increment: u32,
}

/// 自 Unix 纪元以来的毫秒数
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UtcDateTime {
    pub millis: i64,
}

/// 能自行提供文档表示的宿主值
///
/// 编码器会同步调用 [`bson_serialize`](Self::bson_serialize)，
/// 实现必须可重入，并且不能依赖编码器自身的状态。
pub trait BsonSerializable: Send + Sync {
    /// 原始类型名，Persistable 值会以 `__pclass` 字段写入
    fn type_name(&self) -> &str;

    /// 返回替代的 map 或序列
    fn bson_serialize(&self) -> Result<HostValue, CallbackFailure>;

    fn is_persistable(&self) -> bool {
        false
    }
}

/// 包装一个 [`BsonSerializable`] 实现
///
/// 相等性按实例判断。
#[derive(Clone)]
pub struct Serializable(Arc<dyn BsonSerializable>);

impl Serializable {
    pub fn new<T: BsonSerializable + 'static>(inner: T) -> Self {
        Self(Arc::new(inner))
    }

    pub fn type_name(&self) -> &str {
        self.0.type_name()
    }

    pub fn is_persistable(&self) -> bool {
        self.0.is_persistable()
    }

    pub(crate) fn produce(&self) -> Result<HostValue, CallbackFailure> {
        self.0.bson_serialize()
    }
}

impl fmt::Debug for Serializable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Serializable").field(&self.type_name()).finish()
    }
}

impl PartialEq for Serializable {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Binary {
    pub fn new(subtype: u8, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            subtype,
            bytes: bytes.into(),
        }
    }
}

impl JavaScriptCode {
    pub fn new(code: impl Into<CompactString>) -> Self {
        Self {
            code: code.into(),
            scope: None,
        }
    }

    pub fn with_scope(code: impl Into<CompactString>, scope: HostValue) -> Self {
        Self {
            code: code.into(),
            scope: Some(Box::new(scope)),
        }
    }
}

impl Regex {
    pub fn new(pattern: impl Into<CompactString>, flags: impl Into<CompactString>) -> Self {
        Self {
            pattern: pattern.into(),
            flags: flags.into(),
        }
    }
}

impl UtcDateTime {
    pub fn from_millis(millis: i64) -> Self {
        Self { millis }
    }

    /// 转换为 chrono 的 UTC 时间
    ///
    /// # Returns
    /// 毫秒数超出 chrono 可表示范围时返回 `None`
    pub fn to_chrono(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.millis).single()
    }

    pub fn from_chrono(dt: DateTime<Utc>) -> Self {
        Self {
            millis: dt.timestamp_millis(),
        }
    }
}

impl HostObject {
    pub const STD_CLASS: &'static str = "stdClass";

    pub fn new(class_name: impl Into<CompactString>) -> Self {
        Self {
            class_name: class_name.into(),
            properties: PropertyMap::new(),
        }
    }

    /// 创建属性已就绪的通用对象
    pub fn std_class(properties: PropertyMap) -> Self {
        Self {
            class_name: CompactString::new(Self::STD_CLASS),
            properties,
        }
    }

    pub fn insert(&mut self, name: impl Into<CompactString>, value: impl Into<HostValue>) {
        self.properties.insert(name.into(), value.into());
    }

    /// 插入受保护属性，键存储为 `"\0*\0name"`
    pub fn insert_protected(&mut self, name: &str, value: impl Into<HostValue>) {
        let key = format!("\0*\0{}", name);
        self.properties.insert(CompactString::from(key), value.into());
    }

    /// 插入私有属性，键存储为 `"\0Class\0name"`
    pub fn insert_private(&mut self, name: &str, value: impl Into<HostValue>) {
        let key = format!("\0{}\0{}", self.class_name, name);
        self.properties.insert(CompactString::from(key), value.into());
    }

    /// 按逻辑属性名查找，忽略可见性标记
    pub fn get(&self, name: &str) -> Option<&HostValue> {
        self.properties
            .iter()
            .find(|(k, _)| unmangle_property_name(k) == Some(name))
            .map(|(_, v)| v)
    }
}

/// 去掉属性名上的可见性标记
///
/// # Brief
/// `"\0*\0name"` 与 `"\0Class\0name"` 都还原为 `"name"`，普通属性名原样返回
///
/// # Returns
/// 标记格式错误时返回 `None`
pub fn unmangle_property_name(raw: &str) -> Option<&str> {
    let Some(rest) = raw.strip_prefix('\0') else {
        return Some(raw);
    };
    let end = rest.find('\0')?;
    if end == 0 {
        return None;
    }
    Some(&rest[end + 1..])
}

impl HostValue {
    /// 获取值的类型名称
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Null => "null",
            HostValue::Bool(_) => "boolean",
            HostValue::Int(_) => "integer",
            HostValue::Float(_) => "double",
            HostValue::String(_) => "string",
            HostValue::Sequence(_) => "sequence",
            HostValue::Map(_) => "map",
            HostValue::Object(_) => "object",
            HostValue::Extended(ext) => match ext {
                ExtendedType::Binary(_) => "binary",
                ExtendedType::JavaScriptCode(_) => "javascript",
                ExtendedType::ObjectId(_) => "objectId",
                ExtendedType::Regex(_) => "regex",
                ExtendedType::Timestamp(_) => "timestamp",
                ExtendedType::UtcDateTime(_) => "utcDateTime",
                ExtendedType::MinKey => "minKey",
                ExtendedType::MaxKey => "maxKey",
                ExtendedType::Serializable(_) => "serializable",
            },
            HostValue::Resource(_) => "resource",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HostValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// 尝试获取 f64 值，整数会被转换
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Float(n) => Some(*n),
            HostValue::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&Vec<HostValue>> {
        match self {
            HostValue::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HostMap> {
        match self {
            HostValue::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&HostObject> {
        match self {
            HostValue::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_extended(&self) -> Option<&ExtendedType> {
        match self {
            HostValue::Extended(ext) => Some(ext),
            _ => None,
        }
    }

    /// 获取指定键的值
    ///
    /// # Brief
    /// map 按字符串键（或可解析为下标的整数键）查找，对象按逻辑属性名查找，
    /// 序列按下标查找
    ///
    /// # Arguments
    /// * `key` - 字段名或下标字符串
    ///
    /// # Returns
    /// `Some(&HostValue)` 如果找到，否则 `None`
    pub fn get(&self, key: &str) -> Option<&HostValue> {
        match self {
            HostValue::Map(map) => map.get(&Key::from(key)).or_else(|| {
                key.parse::<i64>()
                    .ok()
                    .and_then(|i| map.get(&Key::Index(i)))
            }),
            HostValue::Object(obj) => obj.get(key),
            HostValue::Sequence(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    }

    /// 容器中的元素个数，标量返回 `None`
    pub fn len(&self) -> Option<usize> {
        match self {
            HostValue::Sequence(items) => Some(items.len()),
            HostValue::Map(map) => Some(map.len()),
            HostValue::Object(obj) => Some(obj.properties.len()),
            _ => None,
        }
    }

    /// 以出现顺序遍历容器的值
    pub fn values(&self) -> Box<dyn Iterator<Item = &HostValue> + '_> {
        match self {
            HostValue::Sequence(items) => Box::new(items.iter()),
            HostValue::Map(map) => Box::new(map.values()),
            HostValue::Object(obj) => Box::new(obj.properties.values()),
            _ => Box::new(std::iter::empty()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Index(i) => write!(f, "{}", i),
            Key::Name(s) => write!(f, "{}", s),
        }
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Null => write!(f, "null"),
            HostValue::Bool(b) => write!(f, "{}", b),
            HostValue::Int(n) => write!(f, "{}", n),
            HostValue::Float(n) => write!(f, "{}", n),
            HostValue::String(s) => write!(f, "{:?}", s.as_str()),
            HostValue::Sequence(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            HostValue::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\": {}", k, v)?;
                }
                write!(f, "}}")
            }
            HostValue::Object(obj) => {
                write!(f, "{} {{", obj.class_name)?;
                for (i, (k, v)) in obj.properties.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    let name = unmangle_property_name(k).unwrap_or(k.as_str());
                    write!(f, "\"{}\": {}", name, v)?;
                }
                write!(f, "}}")
            }
            HostValue::Extended(ext) => match ext {
                ExtendedType::Binary(b) => {
                    write!(f, "Binary({}, <{} bytes>)", b.subtype, b.bytes.len())
                }
                ExtendedType::JavaScriptCode(js) => match &js.scope {
                    Some(scope) => write!(f, "Javascript({:?}, scope: {})", js.code.as_str(), scope),
                    None => write!(f, "Javascript({:?})", js.code.as_str()),
                },
                ExtendedType::ObjectId(id) => write!(f, "ObjectId(\"{}\")", id),
                ExtendedType::Regex(r) => write!(f, "/{}/{}", r.pattern, r.flags),
                ExtendedType::Timestamp(ts) => {
                    write!(f, "Timestamp({}, {})", ts.seconds, ts.increment)
                }
                ExtendedType::UtcDateTime(dt) => write!(f, "UTCDateTime({})", dt.millis),
                ExtendedType::MinKey => write!(f, "MinKey"),
                ExtendedType::MaxKey => write!(f, "MaxKey"),
                ExtendedType::Serializable(s) => write!(f, "Serializable({})", s.type_name()),
            },
            HostValue::Resource(kind) => write!(f, "resource({})", kind),
        }
    }
}

// ============================================================================
// From 特征实现
// ============================================================================

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::Name(CompactString::from(v))
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::Name(CompactString::from(v))
    }
}

impl From<CompactString> for Key {
    fn from(v: CompactString) -> Self {
        Key::Name(v)
    }
}

impl From<i32> for Key {
    fn from(v: i32) -> Self {
        Key::Index(v as i64)
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Index(v)
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        HostValue::Bool(v)
    }
}

impl From<i32> for HostValue {
    fn from(v: i32) -> Self {
        HostValue::Int(v as i64)
    }
}

impl From<i64> for HostValue {
    fn from(v: i64) -> Self {
        HostValue::Int(v)
    }
}

impl From<u32> for HostValue {
    fn from(v: u32) -> Self {
        HostValue::Int(v as i64)
    }
}

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        HostValue::Float(v)
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        HostValue::String(CompactString::from(v))
    }
}

impl From<String> for HostValue {
    fn from(v: String) -> Self {
        HostValue::String(CompactString::from(v))
    }
}

impl From<CompactString> for HostValue {
    fn from(v: CompactString) -> Self {
        HostValue::String(v)
    }
}

impl From<HostMap> for HostValue {
    fn from(v: HostMap) -> Self {
        HostValue::Map(v)
    }
}

impl From<HostObject> for HostValue {
    fn from(v: HostObject) -> Self {
        HostValue::Object(v)
    }
}

impl<T: Into<HostValue>> From<Vec<T>> for HostValue {
    fn from(v: Vec<T>) -> Self {
        HostValue::Sequence(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(HostValue::Null)
    }
}

impl From<ExtendedType> for HostValue {
    fn from(v: ExtendedType) -> Self {
        HostValue::Extended(v)
    }
}

impl From<ObjectId> for HostValue {
    fn from(v: ObjectId) -> Self {
        HostValue::Extended(ExtendedType::ObjectId(v))
    }
}

impl From<Binary> for HostValue {
    fn from(v: Binary) -> Self {
        HostValue::Extended(ExtendedType::Binary(v))
    }
}

impl From<JavaScriptCode> for HostValue {
    fn from(v: JavaScriptCode) -> Self {
        HostValue::Extended(ExtendedType::JavaScriptCode(v))
    }
}

impl From<Regex> for HostValue {
    fn from(v: Regex) -> Self {
        HostValue::Extended(ExtendedType::Regex(v))
    }
}

impl From<Timestamp> for HostValue {
    fn from(v: Timestamp) -> Self {
        HostValue::Extended(ExtendedType::Timestamp(v))
    }
}

impl From<UtcDateTime> for HostValue {
    fn from(v: UtcDateTime) -> Self {
        HostValue::Extended(ExtendedType::UtcDateTime(v))
    }
}

impl From<Serializable> for HostValue {
    fn from(v: Serializable) -> Self {
        HostValue::Extended(ExtendedType::Serializable(v))
    }
}

/// 构造 HostValue 的便捷宏
///
/// # 示例
///
/// ```rust,ignore
/// use docbridge_bson::host;
///
/// let null = host!(null);
/// let list = host!([1, 2, 3]);
/// let doc = host!({ "name": "test", "value": 123 });
/// ```
#[macro_export]
macro_rules! host {
    (null) => {
        $crate::HostValue::Null
    };
    (true) => {
        $crate::HostValue::Bool(true)
    };
    (false) => {
        $crate::HostValue::Bool(false)
    };
    ([ $($elem:tt),* $(,)? ]) => {
        $crate::HostValue::Sequence(vec![ $($crate::host!($elem)),* ])
    };
    ({ $($key:tt : $value:tt),* $(,)? }) => {
        {
            #[allow(unused_mut)]
            let mut map = $crate::HostMap::new();
            $(
                map.insert($crate::Key::from($key), $crate::host!($value));
            )*
            $crate::HostValue::Map(map)
        }
    };
    ($e:expr) => {
        $crate::HostValue::from($e)
    };
}
