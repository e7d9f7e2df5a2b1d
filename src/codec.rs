/*! Declarative packet codec.

A packet type is described as an ordered list of named [`Field`]s. From
that description a [`Schema`] compiles a small program of decode steps,
so per-packet work is a walk over precomputed segment descriptors
instead of a re-interpretation of the field list. Runs of fixed-width
fields are coalesced into one segment with a single bounds check.

All multi-byte values are little-endian on the wire.

```
use std::sync::Arc;
use packetstream::codec::{Field, FieldType, Record, Schema, Value};

let schema = Arc::new(Schema::new(
    "FileChunk",
    Some(5),
    vec![
        Field::u32("offset"),
        Field::u16("len"),
        Field::var_array("data", FieldType::U8, "len"),
        Field::cstring("name"),
    ],
)?);
let mut rec = Record::new(&schema);
rec.set("offset", 0x1000u32)?;
rec.set("data", vec![Value::from(1u8), Value::from(2u8), Value::from(3u8)])?;
rec.set("name", "cube.g")?;
let bytes = rec.encode()?;
// "len" was filled in from the array automatically.
assert_eq!(Schema::decode(&schema, &bytes)?.uint("len")?, 3);
# Ok::<(), packetstream::Error>(())
```
*/
use std::sync::Arc;

use crate::checksum;
use crate::{Error, Result};

/// Fixed-width primitive field kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Prim {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl Prim {
    /// Encoded size in bytes.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Prim::U8 | Prim::I8 => 1,
            Prim::U16 | Prim::I16 => 2,
            Prim::U32 | Prim::I32 | Prim::F32 => 4,
            Prim::U64 | Prim::I64 | Prim::F64 => 8,
        }
    }

    const fn is_integer(self) -> bool {
        !matches!(self, Prim::F32 | Prim::F64)
    }

    const fn is_signed(self) -> bool {
        matches!(self, Prim::I8 | Prim::I16 | Prim::I32 | Prim::I64)
    }
}

/// Length of an array field.
#[derive(Clone, Debug)]
pub enum ArrayLen {
    /// Known when the schema is written.
    Fixed(usize),
    /// The runtime value of an earlier integer field with this name.
    Field(String),
}

/// A field type. Composes recursively through arrays and nested records.
#[derive(Clone, Debug)]
pub enum FieldType {
    /// Fixed-width integer or float.
    Prim(Prim),
    /// Null-terminated UTF-8 string.
    CString,
    /// Raw byte span; on decode, swallows the rest of the buffer.
    Bytes,
    /// CRC-8 of the containing record's bytes up to this point.
    Crc8,
    /// CRC-16 of the containing record's bytes up to this point.
    Crc16,
    /// Array of a uniform element type.
    Array(Box<FieldType>, ArrayLen),
    /// A field whose type is itself a schema.
    Record(Arc<Schema>),
}

#[allow(missing_docs)]
impl FieldType {
    pub const U8: FieldType = FieldType::Prim(Prim::U8);
    pub const I8: FieldType = FieldType::Prim(Prim::I8);
    pub const U16: FieldType = FieldType::Prim(Prim::U16);
    pub const I16: FieldType = FieldType::Prim(Prim::I16);
    pub const U32: FieldType = FieldType::Prim(Prim::U32);
    pub const I32: FieldType = FieldType::Prim(Prim::I32);
    pub const U64: FieldType = FieldType::Prim(Prim::U64);
    pub const I64: FieldType = FieldType::Prim(Prim::I64);
    pub const F32: FieldType = FieldType::Prim(Prim::F32);
    pub const F64: FieldType = FieldType::Prim(Prim::F64);
}

/// A named field in a schema.
#[derive(Clone, Debug)]
pub struct Field {
    pub(crate) name: String,
    pub(crate) ty: FieldType,
}

impl Field {
    /// Create a field of an arbitrary type.
    pub fn new(name: impl Into<String>, ty: FieldType) -> Field {
        Field {
            name: name.into(),
            ty,
        }
    }

    /// Null-terminated UTF-8 string field.
    pub fn cstring(name: impl Into<String>) -> Field {
        Field::new(name, FieldType::CString)
    }

    /// Raw byte span to the end of the buffer.
    pub fn bytes(name: impl Into<String>) -> Field {
        Field::new(name, FieldType::Bytes)
    }

    /// Embedded CRC-8 of the record bytes so far.
    pub fn crc8(name: impl Into<String>) -> Field {
        Field::new(name, FieldType::Crc8)
    }

    /// Embedded CRC-16 of the record bytes so far.
    pub fn crc16(name: impl Into<String>) -> Field {
        Field::new(name, FieldType::Crc16)
    }

    /// Array whose length is fixed in the schema.
    pub fn array(name: impl Into<String>, elem: FieldType, len: usize) -> Field {
        Field::new(name, FieldType::Array(Box::new(elem), ArrayLen::Fixed(len)))
    }

    /// Array whose length is the value of an earlier integer field.
    pub fn var_array(name: impl Into<String>, elem: FieldType, len_field: &str) -> Field {
        Field::new(
            name,
            FieldType::Array(Box::new(elem), ArrayLen::Field(len_field.to_string())),
        )
    }

    /// Nested record field.
    pub fn record(name: impl Into<String>, schema: &Arc<Schema>) -> Field {
        Field::new(name, FieldType::Record(schema.clone()))
    }
}

macro_rules! prim_ctor {
    ($($fn_name:ident => $prim:ident),* $(,)?) => {
        #[allow(missing_docs)]
        impl Field {
            $(pub fn $fn_name(name: impl Into<String>) -> Field {
                Field::new(name, FieldType::Prim(Prim::$prim))
            })*
        }
    };
}
prim_ctor!(
    u8 => U8, i8 => I8, u16 => U16, i16 => I16,
    u32 => U32, i32 => I32, u64 => U64, i64 => I64,
    f32 => F32, f64 => F64,
);

/// How an array length is found once the schema is compiled.
#[derive(Clone, Debug)]
enum ResolvedLen {
    Fixed(usize),
    /// Index of the length field in the record.
    Field(usize),
}

/// One precompiled decode/encode step.
#[derive(Clone, Debug)]
enum Op {
    /// A coalesced run of fixed-width fields, unpacked from one slice.
    Packed {
        first: usize,
        prims: Vec<Prim>,
        size: usize,
    },
    CString(usize),
    Bytes(usize),
    Crc {
        wide: bool,
    },
    Array {
        index: usize,
        elem: FieldType,
        len: ResolvedLen,
    },
    Nested {
        index: usize,
        schema: Arc<Schema>,
    },
}

/// A compiled packet schema.
#[derive(Debug)]
pub struct Schema {
    name: String,
    packet_id: Option<u8>,
    fields: Vec<Field>,
    program: Vec<Op>,
}

impl Schema {
    /// Compile a schema from a field list.
    ///
    /// `packet_id` is the default id used when the schema is registered
    /// with a service; it can be overridden at registration time.
    pub fn new(
        name: impl Into<String>,
        packet_id: Option<u8>,
        fields: Vec<Field>,
    ) -> Result<Schema> {
        let name = name.into();
        let program = compile(&name, &fields)?;
        Ok(Schema {
            name,
            packet_id,
            fields,
            program,
        })
    }

    /// Schema name, used in log and error messages.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Default packet id, if the schema declares one.
    #[must_use]
    pub fn packet_id(&self) -> Option<u8> {
        self.packet_id
    }

    /// The field list the schema was built from.
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Decode one record from `data`.
    ///
    /// Trailing bytes after the last field are ignored, matching the
    /// frame parser which hands over exactly one payload.
    pub fn decode(self: &Arc<Self>, data: &[u8]) -> Result<Record> {
        let mut cur = Cursor { data, pos: 0 };
        self.decode_cursor(&mut cur)
    }

    fn decode_cursor(self: &Arc<Self>, cur: &mut Cursor) -> Result<Record> {
        let mut values: Vec<Value> = Vec::with_capacity(self.fields.len());
        for op in &self.program {
            match op {
                Op::Packed { prims, size, .. } => {
                    let chunk = cur.take(*size).map_err(|e| self.err(e))?;
                    let mut off = 0;
                    for p in prims {
                        values.push(decode_prim(*p, &chunk[off..]));
                        off += p.size();
                    }
                }
                Op::CString(_) => values.push(Value::Str(decode_cstring(cur)?)),
                Op::Bytes(_) => values.push(Value::Bytes(cur.rest().to_vec())),
                Op::Crc { wide } => {
                    let v = if *wide {
                        let b = cur.take(2).map_err(|e| self.err(e))?;
                        u64::from(u16::from_le_bytes([b[0], b[1]]))
                    } else {
                        u64::from(cur.take(1).map_err(|e| self.err(e))?[0])
                    };
                    values.push(Value::Uint(v));
                }
                Op::Array { index, elem, len } => {
                    let n = match len {
                        ResolvedLen::Fixed(n) => *n,
                        ResolvedLen::Field(idx) => values[*idx].as_len().map_err(|e| {
                            self.field_err(*index, e)
                        })?,
                    };
                    // A length field can claim anything; every element
                    // costs at least one byte in well-formed input.
                    if n > cur.remaining() {
                        return Err(self.field_err(
                            *index,
                            Error::Codec(format!(
                                "declared length {n} exceeds {} remaining bytes",
                                cur.remaining()
                            )),
                        ));
                    }
                    let mut items = Vec::with_capacity(n);
                    for _ in 0..n {
                        items.push(decode_elem(elem, cur)?);
                    }
                    values.push(Value::Array(items));
                }
                Op::Nested { schema, .. } => {
                    values.push(Value::Record(schema.decode_cursor(cur)?));
                }
            }
        }
        Ok(Record {
            schema: self.clone(),
            values,
        })
    }

    fn err(&self, e: Error) -> Error {
        Error::Codec(format!("{}: {e}", self.name))
    }

    fn field_err(&self, index: usize, e: Error) -> Error {
        Error::Codec(format!("{}.{}: {e}", self.name, self.fields[index].name))
    }
}

fn compile(name: &str, fields: &[Field]) -> Result<Vec<Op>> {
    let mut ops = Vec::new();
    let mut run: Vec<Prim> = Vec::new();
    let mut run_first = 0;
    let flush = |ops: &mut Vec<Op>, run: &mut Vec<Prim>, first: usize| {
        if !run.is_empty() {
            let size = run.iter().map(|p| p.size()).sum();
            ops.push(Op::Packed {
                first,
                prims: std::mem::take(run),
                size,
            });
        }
    };
    for (i, f) in fields.iter().enumerate() {
        match &f.ty {
            FieldType::Prim(p) => {
                if run.is_empty() {
                    run_first = i;
                }
                run.push(*p);
            }
            other => {
                flush(&mut ops, &mut run, run_first);
                match other {
                    FieldType::CString => ops.push(Op::CString(i)),
                    FieldType::Bytes => ops.push(Op::Bytes(i)),
                    FieldType::Crc8 => ops.push(Op::Crc { wide: false }),
                    FieldType::Crc16 => ops.push(Op::Crc { wide: true }),
                    FieldType::Array(elem, len) => {
                        if !matches!(
                            elem.as_ref(),
                            FieldType::Prim(_) | FieldType::CString | FieldType::Record(_)
                        ) {
                            return Err(Error::InvalidArgument(format!(
                                "{name}.{}: unsupported array element type",
                                f.name
                            )));
                        }
                        let len = match len {
                            ArrayLen::Fixed(n) => ResolvedLen::Fixed(*n),
                            ArrayLen::Field(len_name) => {
                                // Resolve to the most recently declared
                                // integer field with that name.
                                let idx = fields[..i]
                                    .iter()
                                    .rposition(|g| {
                                        g.name == *len_name
                                            && matches!(&g.ty,
                                                FieldType::Prim(p) if p.is_integer())
                                    })
                                    .ok_or_else(|| {
                                        Error::InvalidArgument(format!(
                                            "{name}.{}: no preceding integer \
                                             field named {len_name:?}",
                                            f.name
                                        ))
                                    })?;
                                ResolvedLen::Field(idx)
                            }
                        };
                        ops.push(Op::Array {
                            index: i,
                            elem: elem.as_ref().clone(),
                            len,
                        });
                    }
                    FieldType::Record(s) => ops.push(Op::Nested {
                        index: i,
                        schema: s.clone(),
                    }),
                    FieldType::Prim(_) => {}
                }
            }
        }
    }
    flush(&mut ops, &mut run, run_first);
    Ok(ops)
}

/// A dynamically typed field value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Unsigned integer, also used for embedded CRC fields.
    Uint(u64),
    /// Signed integer.
    Int(i64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
    /// String.
    Str(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Array of uniform values.
    Array(Vec<Value>),
    /// Nested record.
    Record(Record),
}

impl Value {
    fn as_len(&self) -> Result<usize> {
        match self {
            Value::Uint(n) => Ok(*n as usize),
            Value::Int(n) if *n >= 0 => Ok(*n as usize),
            other => Err(Error::Codec(format!(
                "length field holds non-length value {other:?}"
            ))),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Uint(_) => "uint",
            Value::Int(_) => "int",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Record(_) => "record",
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident as $conv:ty),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Value { Value::$variant(v as $conv) }
        })*
    };
}
value_from!(
    u8 => Uint as u64, u16 => Uint as u64, u32 => Uint as u64, u64 => Uint as u64,
    i8 => Int as i64, i16 => Int as i64, i32 => Int as i64, i64 => Int as i64,
    f32 => F32 as f32, f64 => F64 as f64,
);

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Str(v)
    }
}
impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Value {
        Value::Bytes(v)
    }
}
impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Value {
        Value::Bytes(v.to_vec())
    }
}
impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Value {
        Value::Array(v)
    }
}
impl From<Record> for Value {
    fn from(v: Record) -> Value {
        Value::Record(v)
    }
}

/// A record instance of a schema.
#[derive(Clone, Debug)]
pub struct Record {
    schema: Arc<Schema>,
    values: Vec<Value>,
}

impl PartialEq for Record {
    fn eq(&self, other: &Record) -> bool {
        self.schema.name == other.schema.name && self.values == other.values
    }
}

impl Record {
    /// Create a record with type-appropriate defaults: zero for
    /// numerics, empty strings and byte spans, zero-filled fixed
    /// arrays, empty variable arrays, default nested records.
    #[must_use]
    pub fn new(schema: &Arc<Schema>) -> Record {
        let values = schema.fields.iter().map(|f| default_value(&f.ty)).collect();
        Record {
            schema: schema.clone(),
            values,
        }
    }

    /// Create a record supplying a prefix of the fields positionally.
    pub fn with_values<I>(schema: &Arc<Schema>, values: I) -> Result<Record>
    where
        I: IntoIterator<Item = Value>,
    {
        let mut rec = Record::new(schema);
        for (i, v) in values.into_iter().enumerate() {
            let Some(field) = schema.fields.get(i) else {
                return Err(Error::InvalidArgument(format!(
                    "{}: more values than fields",
                    schema.name
                )));
            };
            check_kind(&schema.name, field, &v)?;
            rec.values[i] = v;
        }
        Ok(rec)
    }

    /// The schema this record belongs to.
    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Set a field by name.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let schema = self.schema.clone();
        let idx = schema
            .fields
            .iter()
            .rposition(|f| f.name == name)
            .ok_or_else(|| {
                Error::InvalidArgument(format!("{}: no field named {name:?}", schema.name))
            })?;
        let value = value.into();
        check_kind(&schema.name, &schema.fields[idx], &value)?;
        self.values[idx] = value;
        Ok(())
    }

    /// Get a field by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        let idx = self.schema.fields.iter().rposition(|f| f.name == name)?;
        Some(&self.values[idx])
    }

    fn typed<'a, T>(&'a self, name: &str, want: &str, f: impl Fn(&'a Value) -> Option<T>) -> Result<T> {
        let v = self.get(name).ok_or_else(|| {
            Error::InvalidArgument(format!("{}: no field named {name:?}", self.schema.name))
        })?;
        f(v).ok_or_else(|| {
            Error::Codec(format!(
                "{}.{name}: expected {want}, holds {}",
                self.schema.name,
                v.kind()
            ))
        })
    }

    /// Unsigned integer field accessor.
    pub fn uint(&self, name: &str) -> Result<u64> {
        self.typed(name, "uint", |v| match v {
            Value::Uint(n) => Some(*n),
            _ => None,
        })
    }

    /// Signed integer field accessor.
    pub fn int(&self, name: &str) -> Result<i64> {
        self.typed(name, "int", |v| match v {
            Value::Int(n) => Some(*n),
            _ => None,
        })
    }

    /// Float field accessor; widens f32.
    pub fn float(&self, name: &str) -> Result<f64> {
        self.typed(name, "float", |v| match v {
            Value::F32(x) => Some(f64::from(*x)),
            Value::F64(x) => Some(*x),
            _ => None,
        })
    }

    /// String field accessor.
    pub fn text(&self, name: &str) -> Result<&str> {
        self.typed(name, "string", |v| match v {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// Byte span field accessor.
    pub fn bytes(&self, name: &str) -> Result<&[u8]> {
        self.typed(name, "bytes", |v| match v {
            Value::Bytes(b) => Some(b.as_slice()),
            _ => None,
        })
    }

    /// Array field accessor.
    pub fn array(&self, name: &str) -> Result<&[Value]> {
        self.typed(name, "array", |v| match v {
            Value::Array(a) => Some(a.as_slice()),
            _ => None,
        })
    }

    /// Nested record accessor.
    pub fn nested(&self, name: &str) -> Result<&Record> {
        self.typed(name, "record", |v| match v {
            Value::Record(r) => Some(r),
            _ => None,
        })
    }

    /// Fill every variable-array length field from its array's actual
    /// length, recursively. `encode` does this on a working copy; call
    /// it directly when comparing records for equality.
    pub fn update_lengths(&mut self) {
        let schema = self.schema.clone();
        for op in &schema.program {
            if let Op::Array {
                index,
                len: ResolvedLen::Field(li),
                ..
            } = op
            {
                if let Value::Array(items) = &self.values[*index] {
                    let n = items.len();
                    self.values[*li] = match &schema.fields[*li].ty {
                        FieldType::Prim(p) if p.is_signed() => Value::Int(n as i64),
                        _ => Value::Uint(n as u64),
                    };
                }
            }
        }
        for v in &mut self.values {
            match v {
                Value::Record(r) => r.update_lengths(),
                Value::Array(items) => {
                    for item in items {
                        if let Value::Record(r) = item {
                            r.update_lengths();
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Encode the record to wire bytes.
    ///
    /// Variable-array length fields are set from the arrays before
    /// serializing; the record itself is not mutated.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut work = self.clone();
        work.update_lengths();
        let mut out = Vec::new();
        work.encode_into(&mut out)?;
        Ok(out)
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        let start = out.len();
        for op in &self.schema.program {
            match op {
                Op::Packed { first, prims, .. } => {
                    for (k, p) in prims.iter().enumerate() {
                        encode_prim(*p, &self.values[first + k], out)
                            .map_err(|e| self.schema.field_err(first + k, e))?;
                    }
                }
                Op::CString(i) => match &self.values[*i] {
                    Value::Str(s) => {
                        out.extend_from_slice(s.as_bytes());
                        out.push(0);
                    }
                    other => return Err(self.schema.field_err(*i, type_err("string", other))),
                },
                Op::Bytes(i) => match &self.values[*i] {
                    Value::Bytes(b) => out.extend_from_slice(b),
                    other => return Err(self.schema.field_err(*i, type_err("bytes", other))),
                },
                Op::Crc { wide } => {
                    if *wide {
                        let c = checksum::crc16(0, &out[start..]);
                        out.extend_from_slice(&c.to_le_bytes());
                    } else {
                        let c = checksum::crc8(0, &out[start..]);
                        out.push(c);
                    }
                }
                Op::Array { index, elem, len } => {
                    let items = match &self.values[*index] {
                        Value::Array(a) => a,
                        other => {
                            return Err(self.schema.field_err(*index, type_err("array", other)));
                        }
                    };
                    if let ResolvedLen::Fixed(n) = len {
                        if items.len() != *n {
                            return Err(self.schema.field_err(
                                *index,
                                Error::Codec(format!(
                                    "fixed array holds {} items, declared {n}",
                                    items.len()
                                )),
                            ));
                        }
                    }
                    for item in items {
                        encode_elem(elem, item, out)
                            .map_err(|e| self.schema.field_err(*index, e))?;
                    }
                }
                Op::Nested { index, .. } => match &self.values[*index] {
                    Value::Record(r) => r.encode_into(out)?,
                    other => return Err(self.schema.field_err(*index, type_err("record", other))),
                },
            }
        }
        Ok(())
    }
}

fn type_err(want: &str, got: &Value) -> Error {
    Error::Codec(format!("expected {want}, holds {}", got.kind()))
}

fn check_kind(schema: &str, field: &Field, value: &Value) -> Result<()> {
    let ok = match (&field.ty, value) {
        (FieldType::Prim(p), Value::Uint(_)) => !p.is_signed() && p.is_integer(),
        (FieldType::Prim(p), Value::Int(_)) => p.is_signed(),
        (FieldType::Prim(Prim::F32), Value::F32(_)) => true,
        (FieldType::Prim(Prim::F64), Value::F64(_)) => true,
        (FieldType::CString, Value::Str(_)) => true,
        (FieldType::Bytes, Value::Bytes(_)) => true,
        (FieldType::Crc8 | FieldType::Crc16, Value::Uint(_)) => true,
        (FieldType::Array(..), Value::Array(_)) => true,
        (FieldType::Record(_), Value::Record(_)) => true,
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "{schema}.{}: {} value does not fit field",
            field.name,
            value.kind()
        )))
    }
}

fn default_value(ty: &FieldType) -> Value {
    match ty {
        FieldType::Prim(p) if p.is_signed() => Value::Int(0),
        FieldType::Prim(Prim::F32) => Value::F32(0.0),
        FieldType::Prim(Prim::F64) => Value::F64(0.0),
        FieldType::Prim(_) => Value::Uint(0),
        FieldType::CString => Value::Str(String::new()),
        FieldType::Bytes => Value::Bytes(Vec::new()),
        FieldType::Crc8 | FieldType::Crc16 => Value::Uint(0),
        FieldType::Array(elem, ArrayLen::Fixed(n)) => {
            Value::Array(vec![default_value(elem); *n])
        }
        FieldType::Array(_, ArrayLen::Field(_)) => Value::Array(Vec::new()),
        FieldType::Record(s) => Value::Record(Record::new(s)),
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if n > self.remaining() {
            return Err(Error::Codec(format!(
                "buffer underrun, need {n} bytes at offset {}",
                self.pos
            )));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn rest(&mut self) -> &[u8] {
        let s = &self.data[self.pos..];
        self.pos = self.data.len();
        s
    }
}

fn arr<const N: usize>(b: &[u8]) -> [u8; N] {
    let mut a = [0u8; N];
    a.copy_from_slice(&b[..N]);
    a
}

fn decode_prim(p: Prim, b: &[u8]) -> Value {
    match p {
        Prim::U8 => Value::Uint(u64::from(b[0])),
        Prim::I8 => Value::Int(i64::from(b[0] as i8)),
        Prim::U16 => Value::Uint(u64::from(u16::from_le_bytes(arr(b)))),
        Prim::I16 => Value::Int(i64::from(i16::from_le_bytes(arr(b)))),
        Prim::U32 => Value::Uint(u64::from(u32::from_le_bytes(arr(b)))),
        Prim::I32 => Value::Int(i64::from(i32::from_le_bytes(arr(b)))),
        Prim::U64 => Value::Uint(u64::from_le_bytes(arr(b))),
        Prim::I64 => Value::Int(i64::from_le_bytes(arr(b))),
        Prim::F32 => Value::F32(f32::from_le_bytes(arr(b))),
        Prim::F64 => Value::F64(f64::from_le_bytes(arr(b))),
    }
}

fn encode_prim(p: Prim, v: &Value, out: &mut Vec<u8>) -> Result<()> {
    fn range_err(p: Prim, v: &Value) -> Error {
        Error::Codec(format!("{v:?} out of range for {p:?}"))
    }
    match (p, v) {
        (Prim::U8, Value::Uint(n)) => {
            out.push(u8::try_from(*n).map_err(|_| range_err(p, v))?);
        }
        (Prim::I8, Value::Int(n)) => {
            out.push(i8::try_from(*n).map_err(|_| range_err(p, v))? as u8);
        }
        (Prim::U16, Value::Uint(n)) => {
            out.extend_from_slice(&u16::try_from(*n).map_err(|_| range_err(p, v))?.to_le_bytes());
        }
        (Prim::I16, Value::Int(n)) => {
            out.extend_from_slice(&i16::try_from(*n).map_err(|_| range_err(p, v))?.to_le_bytes());
        }
        (Prim::U32, Value::Uint(n)) => {
            out.extend_from_slice(&u32::try_from(*n).map_err(|_| range_err(p, v))?.to_le_bytes());
        }
        (Prim::I32, Value::Int(n)) => {
            out.extend_from_slice(&i32::try_from(*n).map_err(|_| range_err(p, v))?.to_le_bytes());
        }
        (Prim::U64, Value::Uint(n)) => out.extend_from_slice(&n.to_le_bytes()),
        (Prim::I64, Value::Int(n)) => out.extend_from_slice(&n.to_le_bytes()),
        (Prim::F32, Value::F32(x)) => out.extend_from_slice(&x.to_le_bytes()),
        (Prim::F64, Value::F64(x)) => out.extend_from_slice(&x.to_le_bytes()),
        _ => return Err(type_err(&format!("{p:?}"), v)),
    }
    Ok(())
}

fn decode_elem(elem: &FieldType, cur: &mut Cursor) -> Result<Value> {
    match elem {
        FieldType::Prim(p) => Ok(decode_prim(*p, cur.take(p.size())?)),
        FieldType::CString => Ok(Value::Str(decode_cstring(cur)?)),
        FieldType::Record(s) => Ok(Value::Record(s.decode_cursor(cur)?)),
        other => Err(Error::Codec(format!(
            "unsupported array element type {other:?}"
        ))),
    }
}

fn encode_elem(elem: &FieldType, v: &Value, out: &mut Vec<u8>) -> Result<()> {
    match elem {
        FieldType::Prim(p) => encode_prim(*p, v, out),
        FieldType::CString => match v {
            Value::Str(s) => {
                out.extend_from_slice(s.as_bytes());
                out.push(0);
                Ok(())
            }
            other => Err(type_err("string", other)),
        },
        FieldType::Record(_) => match v {
            Value::Record(r) => r.encode_into(out),
            other => Err(type_err("record", other)),
        },
        other => Err(Error::Codec(format!(
            "unsupported array element type {other:?}"
        ))),
    }
}

/// Decode a null-terminated string. A buffer with no terminator yields
/// the remainder as the string.
fn decode_cstring(cur: &mut Cursor) -> Result<String> {
    let rest = &cur.data[cur.pos..];
    let raw = match rest.iter().position(|&b| b == 0) {
        Some(n) => {
            cur.pos += n + 1;
            &rest[..n]
        }
        None => {
            cur.pos = cur.data.len();
            rest
        }
    };
    String::from_utf8(raw.to_vec()).map_err(|e| Error::Codec(format!("invalid UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;

    fn schema(fields: Vec<Field>) -> Arc<Schema> {
        Arc::new(Schema::new("Test", None, fields).unwrap())
    }

    #[test]
    fn packed_roundtrip() -> Result<()> {
        let s = schema(vec![
            Field::u8("a"),
            Field::i16("b"),
            Field::u32("c"),
            Field::f32("d"),
            Field::i64("e"),
            Field::f64("f"),
        ]);
        let mut r = Record::new(&s);
        r.set("a", 0x12u8)?;
        r.set("b", -2i16)?;
        r.set("c", 0xdead_beefu32)?;
        r.set("d", 1.5f32)?;
        r.set("e", -5_000_000_000i64)?;
        r.set("f", -0.25f64)?;
        let bytes = r.encode()?;
        assert_eq!(bytes.len(), 1 + 2 + 4 + 4 + 8 + 8);
        assert_eq!(&bytes[..3], &[0x12, 0xfe, 0xff]);
        assert_eq!(Schema::decode(&s, &bytes)?, r);
        Ok(())
    }

    #[test]
    fn little_endian_layout() -> Result<()> {
        let s = schema(vec![Field::u16("a"), Field::u16("b")]);
        let r = Record::with_values(&s, [0x1234u16.into(), 0xabcdu16.into()])?;
        assert_eq!(r.encode()?, vec![0x34, 0x12, 0xcd, 0xab]);
        Ok(())
    }

    #[test]
    fn cstring_roundtrip() -> Result<()> {
        let s = schema(vec![Field::cstring("name"), Field::u8("tail")]);
        let mut r = Record::new(&s);
        r.set("name", "cube.g")?;
        r.set("tail", 9u8)?;
        let bytes = r.encode()?;
        assert_eq!(&bytes[..7], b"cube.g\0");
        let back = Schema::decode(&s, &bytes)?;
        assert_eq!(back.text("name")?, "cube.g");
        assert_eq!(back.uint("tail")?, 9);
        Ok(())
    }

    #[test]
    fn cstring_missing_terminator_takes_remainder() -> Result<()> {
        let s = schema(vec![Field::cstring("name")]);
        let back = Schema::decode(&s, b"no-term")?;
        assert_eq!(back.text("name")?, "no-term");
        Ok(())
    }

    #[test]
    fn bytes_swallow_rest() -> Result<()> {
        let s = schema(vec![Field::u8("kind"), Field::bytes("data")]);
        let back = Schema::decode(&s, &[7, 1, 2, 3, 4])?;
        assert_eq!(back.uint("kind")?, 7);
        assert_eq!(back.bytes("data")?, &[1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn fixed_array_roundtrip() -> Result<()> {
        let s = schema(vec![Field::array("taps", FieldType::U16, 3)]);
        let mut r = Record::new(&s);
        assert_eq!(r.array("taps")?.len(), 3);
        r.set(
            "taps",
            vec![Value::from(1u16), Value::from(2u16), Value::from(3u16)],
        )?;
        let bytes = r.encode()?;
        assert_eq!(bytes, vec![1, 0, 2, 0, 3, 0]);
        assert_eq!(Schema::decode(&s, &bytes)?, r);
        Ok(())
    }

    #[test]
    fn var_array_sets_length_field() -> Result<()> {
        let s = schema(vec![
            Field::u16("count"),
            Field::var_array("items", FieldType::U8, "count"),
        ]);
        let mut r = Record::new(&s);
        r.set("items", vec![Value::from(9u8), Value::from(8u8)])?;
        let bytes = r.encode()?;
        assert_eq!(bytes, vec![2, 0, 9, 8]);
        let back = Schema::decode(&s, &bytes)?;
        assert_eq!(back.uint("count")?, 2);
        assert_eq!(back.array("items")?.len(), 2);
        Ok(())
    }

    #[test]
    fn var_array_zero_length() -> Result<()> {
        let s = schema(vec![
            Field::u8("count"),
            Field::var_array("items", FieldType::U32, "count"),
        ]);
        let r = Record::new(&s);
        let bytes = r.encode()?;
        assert_eq!(bytes, vec![0]);
        assert!(Schema::decode(&s, &bytes)?.array("items")?.is_empty());
        Ok(())
    }

    #[test]
    fn var_array_resolves_most_recent_length_field() -> Result<()> {
        // Two fields named "n": the second one governs the array.
        let s = schema(vec![
            Field::u8("n"),
            Field::u8("n"),
            Field::var_array("items", FieldType::U8, "n"),
        ]);
        let back = Schema::decode(&s, &[9, 2, 5, 6])?;
        assert_eq!(back.array("items")?.len(), 2);
        Ok(())
    }

    #[test]
    fn embedded_crc_fields() -> Result<()> {
        let s = schema(vec![
            Field::u16("a"),
            Field::crc8("hsum"),
            Field::bytes("data"),
        ]);
        let mut r = Record::new(&s);
        r.set("a", 0x0102u16)?;
        r.set("data", vec![0xaau8, 0xbb])?;
        let bytes = r.encode()?;
        assert_eq!(bytes[2], crate::checksum::crc8(0, &bytes[..2]));
        let back = Schema::decode(&s, &bytes)?;
        assert_eq!(back.uint("hsum")?, u64::from(bytes[2]));
        Ok(())
    }

    #[test]
    fn crc16_covers_record_local_bytes() -> Result<()> {
        let inner = Arc::new(Schema::new(
            "Inner",
            None,
            vec![Field::u8("x"), Field::crc16("sum")],
        )?);
        let s = schema(vec![Field::u32("pad"), Field::record("inner", &inner)]);
        let mut r = Record::new(&s);
        r.set("pad", 0xffff_ffffu32)?;
        let mut i = Record::new(&inner);
        i.set("x", 0x55u8)?;
        r.set("inner", i)?;
        let bytes = r.encode()?;
        // The nested CRC covers only the nested record's own bytes.
        let want = crate::checksum::crc16(0, &[0x55]);
        assert_eq!(u16::from_le_bytes([bytes[5], bytes[6]]), want);
        Ok(())
    }

    #[test]
    fn nested_record_roundtrip() -> Result<()> {
        let point = Arc::new(Schema::new(
            "Point",
            None,
            vec![Field::i32("x"), Field::i32("y")],
        )?);
        let s = schema(vec![
            Field::u8("id"),
            Field::record("origin", &point),
            Field::record("target", &point),
        ]);
        let mut r = Record::new(&s);
        let mut p = Record::new(&point);
        p.set("x", -4i32)?;
        p.set("y", 9i32)?;
        r.set("target", p)?;
        let bytes = r.encode()?;
        assert_eq!(bytes.len(), 1 + 8 + 8);
        assert_eq!(Schema::decode(&s, &bytes)?, r);
        Ok(())
    }

    #[test]
    fn decode_short_buffer_fails() {
        let s = schema(vec![Field::u32("a")]);
        assert!(Schema::decode(&s, &[1, 2]).is_err());
    }

    #[test]
    fn var_array_without_length_field_rejected() {
        let r = Schema::new(
            "Bad",
            None,
            vec![Field::var_array("items", FieldType::U8, "missing")],
        );
        assert!(r.is_err());
    }

    #[test]
    fn wrong_value_kind_rejected() {
        let s = schema(vec![Field::u8("a")]);
        let mut r = Record::new(&s);
        assert!(r.set("a", "text").is_err());
        assert!(r.set("a", -1i8).is_err());
        assert!(r.set("b", 0u8).is_err());
    }

    #[test]
    fn out_of_range_encode_fails() -> Result<()> {
        let s = schema(vec![Field::u8("a")]);
        let mut r = Record::new(&s);
        r.set("a", 300u16)?;
        assert!(r.encode().is_err());
        Ok(())
    }
}
