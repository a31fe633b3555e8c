//! Growable encoder for data blocks.

use super::reader::DataBlockReader;
use super::types::{Array, ArrayData, Complex, DataBlockType, Value};
use bytes::{BufMut, Bytes, BytesMut};

/// Initial buffer capacity in bytes.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Accumulates typed objects into a byte buffer.
///
/// The writer holds only the objects themselves. Message headers and the
/// trailing terminate tag are added by the framing functions in
/// [`message`](super::message).
#[derive(Debug, Clone)]
pub struct DataBlockWriter {
    // ---
    buf: BytesMut,
}

impl Default for DataBlockWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl DataBlockWriter {
    // ---

    pub fn new() -> Self {
        // ---
        Self {
            buf: BytesMut::with_capacity(DEFAULT_CAPACITY),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Encoded objects, without any framing.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Reader over a snapshot of the encoded objects.
    pub fn reader(&self) -> DataBlockReader {
        DataBlockReader::new(Bytes::copy_from_slice(&self.buf))
    }

    /// Grow to `(used + space) * 2` when `space` more bytes do not fit.
    fn ensure(&mut self, space: usize) {
        // ---
        let end = self.buf.len();
        if end + space > self.buf.capacity() {
            let target = (end + space) * 2;
            self.buf.reserve(target - end);
        }
    }

    fn put_tag(&mut self, ty: DataBlockType) {
        // ---
        self.ensure(1);
        self.buf.put_u8(ty.tag());
    }

    fn put_len(&mut self, len: usize) {
        // ---
        self.ensure(4);
        self.buf.put_i32_le(len as i32);
    }

    fn put_raw_str(&mut self, s: &str) {
        // ---
        self.put_len(s.len());
        self.ensure(s.len());
        self.buf.put_slice(s.as_bytes());
    }

    pub fn add_byte(&mut self, v: u8) -> &mut Self {
        // ---
        self.put_tag(DataBlockType::Byte);
        self.ensure(1);
        self.buf.put_u8(v);
        self
    }

    pub fn add_integer(&mut self, v: i32) -> &mut Self {
        // ---
        self.put_tag(DataBlockType::Integer);
        self.ensure(4);
        self.buf.put_i32_le(v);
        self
    }

    pub fn add_double(&mut self, v: f64) -> &mut Self {
        // ---
        self.put_tag(DataBlockType::Double);
        self.ensure(8);
        self.buf.put_f64_le(v);
        self
    }

    pub fn add_boolean(&mut self, v: bool) -> &mut Self {
        // ---
        self.put_tag(DataBlockType::Boolean);
        self.ensure(1);
        self.buf.put_u8(u8::from(v));
        self
    }

    pub fn add_string(&mut self, v: &str) -> &mut Self {
        // ---
        self.put_tag(DataBlockType::String);
        self.put_raw_str(v);
        self
    }

    pub fn add_complex(&mut self, v: Complex) -> &mut Self {
        // ---
        self.put_tag(DataBlockType::Complex);
        self.ensure(16);
        self.buf.put_f64_le(v.re);
        self.buf.put_f64_le(v.im);
        self
    }

    pub fn add_void(&mut self) -> &mut Self {
        // ---
        self.put_tag(DataBlockType::Void);
        self
    }

    /// Array: tag, element tag, dimension count, each dimension, then untagged elements.
    ///
    /// List and array elements are written as their bodies, without a tag.
    pub fn add_array(&mut self, array: &Array) -> &mut Self {
        // ---
        self.put_tag(DataBlockType::Array);
        self.put_array_body(array);
        self
    }

    fn put_array_body(&mut self, array: &Array) {
        // ---
        self.put_tag(array.element_type());
        self.put_len(array.dims().len());
        for dim in array.dims() {
            self.put_len(*dim);
        }

        match array.data() {
            ArrayData::Byte(items) => {
                self.ensure(items.len());
                self.buf.put_slice(items);
            }
            ArrayData::Integer(items) => {
                self.ensure(items.len() * 4);
                items.iter().for_each(|v| self.buf.put_i32_le(*v));
            }
            ArrayData::Double(items) => {
                self.ensure(items.len() * 8);
                items.iter().for_each(|v| self.buf.put_f64_le(*v));
            }
            ArrayData::Boolean(items) => {
                self.ensure(items.len());
                items.iter().for_each(|v| self.buf.put_u8(u8::from(*v)));
            }
            ArrayData::String(items) => {
                for s in items {
                    self.put_raw_str(s);
                }
            }
            ArrayData::Complex(items) => {
                self.ensure(items.len() * 16);
                for c in items {
                    self.buf.put_f64_le(c.re);
                    self.buf.put_f64_le(c.im);
                }
            }
            ArrayData::List(items) => {
                for list in items {
                    self.put_list_body(list);
                }
            }
            ArrayData::Array(items) => {
                for inner in items {
                    self.put_array_body(inner);
                }
            }
        }
    }

    /// List: tag, item count, then each item fully typed.
    pub fn add_list(&mut self, items: &[Value]) -> &mut Self {
        // ---
        self.put_tag(DataBlockType::List);
        self.put_list_body(items);
        self
    }

    fn put_list_body(&mut self, items: &[Value]) {
        // ---
        self.put_len(items.len());
        for item in items {
            self.add_value(item);
        }
    }

    /// Wrap everything another writer holds as a single list object.
    ///
    /// The item count is found by skipping the writer's objects one by one.
    /// Fails when the other writer holds a partial object.
    pub fn add_writer_as_list(&mut self, other: &DataBlockWriter) -> crate::Result<&mut Self> {
        // ---
        let mut scan = other.reader();
        let mut count = 0usize;
        while !scan.is_at_end() {
            scan.skip_object()?;
            count += 1;
        }

        self.put_tag(DataBlockType::List);
        self.put_len(count);
        self.ensure(other.len());
        self.buf.put_slice(other.as_bytes());
        Ok(self)
    }

    pub fn add_value(&mut self, value: &Value) -> &mut Self {
        // ---
        match value {
            Value::Byte(v) => self.add_byte(*v),
            Value::Integer(v) => self.add_integer(*v),
            Value::Double(v) => self.add_double(*v),
            Value::Boolean(v) => self.add_boolean(*v),
            Value::String(v) => self.add_string(v),
            Value::Complex(v) => self.add_complex(*v),
            Value::Void => self.add_void(),
            Value::Array(v) => self.add_array(v),
            Value::List(v) => self.add_list(v),
        }
    }

    pub fn add_values(&mut self, values: &[Value]) -> &mut Self {
        // ---
        for value in values {
            self.add_value(value);
        }
        self
    }
}
