//! Cursor-based decoder for data blocks.
//!
//! Every read goes through [`DataBlockReader::take`], which refuses to move
//! past the end of the buffer. A truncated block therefore always surfaces as
//! [`SbwError::EndOfData`] and never as a partially filled value.

use super::types::{Array, ArrayData, Complex, DataBlockType, Value};
use crate::{Result, SbwError};
use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct DataBlockReader {
    // ---
    data: Bytes,
    cursor: usize,
}

fn with_context(ctx: &str) -> String {
    // ---
    if ctx.is_empty() {
        String::new()
    } else {
        format!(" {ctx}")
    }
}

impl DataBlockReader {
    // ---

    pub fn new(data: Bytes) -> Self {
        Self { data, cursor: 0 }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(Bytes::copy_from_slice(data))
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    /// True when no bytes remain.
    pub fn is_at_end(&self) -> bool {
        self.cursor >= self.data.len()
    }

    /// Bytes not yet consumed.
    pub fn rest(&self) -> Bytes {
        self.data.slice(self.cursor..)
    }

    /// Type of the next object, without consuming it.
    ///
    /// The end of the data reads as `Terminate`.
    pub fn peek_type(&self) -> Result<DataBlockType> {
        // ---
        match self.data.get(self.cursor) {
            None => Ok(DataBlockType::Terminate),
            Some(tag) => DataBlockType::from_tag(*tag)
                .ok_or_else(|| SbwError::Malformed(format!("unknown type tag {tag}"))),
        }
    }

    fn take(&mut self, n: usize, expected: DataBlockType, ctx: &str) -> Result<&[u8]> {
        // ---
        if self.remaining() < n {
            return Err(SbwError::EndOfData {
                expected: expected.name(),
                context: with_context(ctx),
            });
        }
        let start = self.cursor;
        self.cursor += n;
        Ok(&self.data[start..self.cursor])
    }

    /// Consume the tag of the next object, requiring it to be `expected`.
    pub fn expect_type(&mut self, expected: DataBlockType, ctx: &str) -> Result<()> {
        // ---
        if self.is_at_end() {
            return Err(SbwError::EndOfData {
                expected: expected.name(),
                context: with_context(ctx),
            });
        }
        let actual = self.peek_type()?;
        if actual != expected {
            return Err(SbwError::TypeMismatch {
                actual: actual.name(),
                expected: expected.name(),
                context: with_context(ctx),
            });
        }
        self.cursor += 1;
        Ok(())
    }

    // --- untagged primitives, also used for message headers

    pub(crate) fn raw_u8(&mut self, ty: DataBlockType, ctx: &str) -> Result<u8> {
        Ok(self.take(1, ty, ctx)?[0])
    }

    pub(crate) fn raw_i32(&mut self, ty: DataBlockType, ctx: &str) -> Result<i32> {
        // ---
        let b = self.take(4, ty, ctx)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn raw_f64(&mut self, ty: DataBlockType, ctx: &str) -> Result<f64> {
        // ---
        let b = self.take(8, ty, ctx)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(b);
        Ok(f64::from_le_bytes(word))
    }

    fn raw_len(&mut self, ty: DataBlockType, ctx: &str) -> Result<usize> {
        // ---
        let len = self.raw_i32(ty, ctx)?;
        usize::try_from(len)
            .map_err(|_| SbwError::Malformed(format!("negative {} length {len}", ty.name())))
    }

    fn raw_string(&mut self, ctx: &str) -> Result<String> {
        // ---
        let len = self.raw_len(DataBlockType::String, ctx)?;
        let bytes = self.take(len, DataBlockType::String, ctx)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| SbwError::Malformed(format!("string is not UTF-8: {e}")))
    }

    fn raw_complex(&mut self, ctx: &str) -> Result<Complex> {
        // ---
        let re = self.raw_f64(DataBlockType::Complex, ctx)?;
        let im = self.raw_f64(DataBlockType::Complex, ctx)?;
        Ok(Complex { re, im })
    }

    // --- typed getters

    pub fn get_byte(&mut self, ctx: &str) -> Result<u8> {
        // ---
        self.expect_type(DataBlockType::Byte, ctx)?;
        self.raw_u8(DataBlockType::Byte, ctx)
    }

    pub fn get_integer(&mut self, ctx: &str) -> Result<i32> {
        // ---
        self.expect_type(DataBlockType::Integer, ctx)?;
        self.raw_i32(DataBlockType::Integer, ctx)
    }

    pub fn get_double(&mut self, ctx: &str) -> Result<f64> {
        // ---
        self.expect_type(DataBlockType::Double, ctx)?;
        self.raw_f64(DataBlockType::Double, ctx)
    }

    pub fn get_boolean(&mut self, ctx: &str) -> Result<bool> {
        // ---
        self.expect_type(DataBlockType::Boolean, ctx)?;
        Ok(self.raw_u8(DataBlockType::Boolean, ctx)? != 0)
    }

    pub fn get_string(&mut self, ctx: &str) -> Result<String> {
        // ---
        self.expect_type(DataBlockType::String, ctx)?;
        self.raw_string(ctx)
    }

    pub fn get_complex(&mut self, ctx: &str) -> Result<Complex> {
        // ---
        self.expect_type(DataBlockType::Complex, ctx)?;
        self.raw_complex(ctx)
    }

    pub fn get_void(&mut self, ctx: &str) -> Result<()> {
        self.expect_type(DataBlockType::Void, ctx)
    }

    /// Array header: element type and dimensions, validated against the bytes left.
    fn array_header(&mut self, ctx: &str) -> Result<(DataBlockType, Vec<usize>, usize)> {
        // ---
        let tag = self.raw_u8(DataBlockType::Array, ctx)?;
        let element = DataBlockType::from_tag(tag)
            .ok_or_else(|| SbwError::Malformed(format!("unknown array element tag {tag}")))?;
        let rank = self.raw_len(DataBlockType::Array, ctx)?;
        if rank == 0 {
            return Err(SbwError::Malformed("array with zero dimensions".into()));
        }
        if rank > self.remaining() / 4 {
            return Err(SbwError::EndOfData {
                expected: DataBlockType::Array.name(),
                context: with_context(ctx),
            });
        }

        let mut dims = Vec::with_capacity(rank);
        let mut count = 1usize;
        for _ in 0..rank {
            let dim = self.raw_len(DataBlockType::Array, ctx)?;
            count = count
                .checked_mul(dim)
                .ok_or_else(|| SbwError::Malformed("array size overflow".into()))?;
            dims.push(dim);
        }

        // Strings, lists and arrays start with at least four bytes each;
        // everything else has a fixed width.
        let min_width = match element {
            DataBlockType::String | DataBlockType::List | DataBlockType::Array => 4,
            other => other.fixed_width().ok_or_else(|| {
                SbwError::Malformed(format!("unsupported array element type {}", other.name()))
            })?,
        };
        let needed = count
            .checked_mul(min_width)
            .ok_or_else(|| SbwError::Malformed("array size overflow".into()))?;
        if needed > self.remaining() {
            return Err(SbwError::EndOfData {
                expected: DataBlockType::Array.name(),
                context: with_context(ctx),
            });
        }
        Ok((element, dims, count))
    }

    pub fn get_array(&mut self, ctx: &str) -> Result<Array> {
        // ---
        self.expect_type(DataBlockType::Array, ctx)?;
        self.array_body(ctx)
    }

    /// Array without its leading tag, as stored inside another array.
    fn array_body(&mut self, ctx: &str) -> Result<Array> {
        // ---
        let (element, dims, count) = self.array_header(ctx)?;

        let data = match element {
            DataBlockType::Byte => ArrayData::Byte(self.take(count, element, ctx)?.to_vec()),
            DataBlockType::Boolean => {
                ArrayData::Boolean(self.take(count, element, ctx)?.iter().map(|b| *b != 0).collect())
            }
            DataBlockType::Integer => ArrayData::Integer(
                (0..count)
                    .map(|_| self.raw_i32(element, ctx))
                    .collect::<Result<_>>()?,
            ),
            DataBlockType::Double => ArrayData::Double(
                (0..count)
                    .map(|_| self.raw_f64(element, ctx))
                    .collect::<Result<_>>()?,
            ),
            DataBlockType::String => ArrayData::String(
                (0..count)
                    .map(|_| self.raw_string(ctx))
                    .collect::<Result<_>>()?,
            ),
            DataBlockType::Complex => ArrayData::Complex(
                (0..count)
                    .map(|_| self.raw_complex(ctx))
                    .collect::<Result<_>>()?,
            ),
            DataBlockType::List => ArrayData::List(
                (0..count)
                    .map(|_| self.list_body(ctx))
                    .collect::<Result<_>>()?,
            ),
            DataBlockType::Array => ArrayData::Array(
                (0..count)
                    .map(|_| self.array_body(ctx))
                    .collect::<Result<_>>()?,
            ),
            other => {
                return Err(SbwError::Malformed(format!(
                    "unsupported array element type {}",
                    other.name()
                )))
            }
        };

        Array::new(dims, data).ok_or_else(|| SbwError::Malformed("array shape mismatch".into()))
    }

    pub fn get_list(&mut self, ctx: &str) -> Result<Vec<Value>> {
        // ---
        self.expect_type(DataBlockType::List, ctx)?;
        self.list_body(ctx)
    }

    /// Item count and typed items of a list whose tag is already consumed.
    fn list_body(&mut self, ctx: &str) -> Result<Vec<Value>> {
        // ---
        let count = self.raw_len(DataBlockType::List, ctx)?;
        // Every item carries at least its tag byte.
        if count > self.remaining() {
            return Err(SbwError::EndOfData {
                expected: DataBlockType::List.name(),
                context: with_context(ctx),
            });
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.get_value(ctx)?);
        }
        Ok(items)
    }

    /// Decode the next object whatever its type.
    pub fn get_value(&mut self, ctx: &str) -> Result<Value> {
        // ---
        if self.is_at_end() {
            return Err(SbwError::EndOfData {
                expected: "object",
                context: with_context(ctx),
            });
        }
        let ty = self.peek_type()?;

        let value = match ty {
            DataBlockType::Byte => Value::Byte(self.get_byte(ctx)?),
            DataBlockType::Integer => Value::Integer(self.get_integer(ctx)?),
            DataBlockType::Double => Value::Double(self.get_double(ctx)?),
            DataBlockType::Boolean => Value::Boolean(self.get_boolean(ctx)?),
            DataBlockType::String => Value::String(self.get_string(ctx)?),
            DataBlockType::Complex => Value::Complex(self.get_complex(ctx)?),
            DataBlockType::Void => {
                self.get_void(ctx)?;
                Value::Void
            }
            DataBlockType::Array => Value::Array(self.get_array(ctx)?),
            DataBlockType::List => Value::List(self.get_list(ctx)?),
            DataBlockType::Terminate | DataBlockType::Error => {
                return Err(SbwError::Malformed(format!(
                    "{} is not a value{}",
                    ty.name(),
                    with_context(ctx)
                )))
            }
        };
        Ok(value)
    }

    /// Decode objects up to the terminate tag (or the end of data).
    ///
    /// The terminate tag, if present, is consumed.
    pub fn get_all(&mut self, ctx: &str) -> Result<Vec<Value>> {
        // ---
        let mut values = Vec::new();
        loop {
            if self.is_at_end() {
                return Ok(values);
            }
            if self.peek_type()? == DataBlockType::Terminate {
                self.cursor += 1;
                return Ok(values);
            }
            values.push(self.get_value(ctx)?);
        }
    }

    /// Skip the next object without materializing it.
    pub fn skip_object(&mut self) -> Result<DataBlockType> {
        // ---
        let ty = self.peek_type()?;
        if self.is_at_end() {
            return Err(SbwError::EndOfData {
                expected: "object",
                context: String::new(),
            });
        }
        self.cursor += 1;
        self.skip_body(ty)?;
        Ok(ty)
    }

    /// Skip an object of type `ty` whose tag is not present.
    fn skip_body(&mut self, ty: DataBlockType) -> Result<()> {
        // ---
        match ty {
            DataBlockType::String => {
                let len = self.raw_len(ty, "")?;
                self.take(len, ty, "")?;
            }
            DataBlockType::Array => {
                let (element, _, count) = self.array_header("")?;
                match element.fixed_width() {
                    Some(width) => {
                        self.take(count * width, ty, "")?;
                    }
                    None => {
                        for _ in 0..count {
                            self.skip_body(element)?;
                        }
                    }
                }
            }
            DataBlockType::List => {
                let count = self.raw_len(ty, "")?;
                for _ in 0..count {
                    self.skip_object()?;
                }
            }
            DataBlockType::Void | DataBlockType::Terminate | DataBlockType::Error => {}
            fixed => {
                let width = fixed.fixed_width().unwrap_or(0);
                self.take(width, fixed, "")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::protocol::DataBlockWriter;

    fn encode(values: &[Value]) -> Bytes {
        // ---
        let mut w = DataBlockWriter::new();
        w.add_values(values);
        Bytes::copy_from_slice(w.as_bytes())
    }

    fn sample_values() -> Vec<Value> {
        // ---
        vec![
            Value::Byte(0xAB),
            Value::Integer(-42),
            Value::Double(3.25),
            Value::Boolean(true),
            Value::String("hello".into()),
            Value::Complex(Complex::new(1.5, -2.0)),
            Value::Void,
            Value::Array(Array::one_dim(ArrayData::Double(vec![1.0, 2.0, 3.0]))),
            Value::Array(
                Array::new(
                    vec![2, 3],
                    ArrayData::Integer(vec![1, 2, 3, 4, 5, 6]),
                )
                .unwrap(),
            ),
            Value::Array(Array::one_dim(ArrayData::String(vec!["a".into(), "".into()]))),
            Value::Array(Array::one_dim(ArrayData::List(vec![
                vec![Value::Integer(42), Value::String("x".into())],
                vec![],
            ]))),
            Value::Array(
                Array::new(
                    vec![1, 2],
                    ArrayData::Array(vec![
                        Array::one_dim(ArrayData::Double(vec![0.5])),
                        Array::one_dim(ArrayData::List(vec![vec![Value::Void]])),
                    ]),
                )
                .unwrap(),
            ),
            Value::List(vec![
                Value::Integer(1),
                Value::List(vec![Value::String("nested".into()), Value::List(vec![])]),
            ]),
        ]
    }

    #[test]
    fn test_round_trip_all_types() {
        // ---
        let values = sample_values();
        let mut r = DataBlockReader::new(encode(&values));
        assert_eq!(r.get_all("").unwrap(), values);
        assert!(r.is_at_end());
    }

    #[test]
    fn test_every_strict_prefix_fails() {
        // ---
        let full = encode(&sample_values());
        for cut in 0..full.len() {
            let mut r = DataBlockReader::new(full.slice(..cut));
            let result = (0..sample_values().len()).try_for_each(|_| r.get_value("").map(|_| ()));
            assert!(result.is_err(), "prefix of {cut} bytes decoded");
            assert!(r.position() <= cut);
        }
    }

    #[test]
    fn test_type_mismatch_names_both_tags() {
        // ---
        let mut r = DataBlockReader::new(encode(&[Value::String("x".into())]));
        let err = r.get_integer("in argument 1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "encountered string required integer in argument 1"
        );
        // Nothing consumed on mismatch.
        assert_eq!(r.position(), 0);
    }

    #[test]
    fn test_end_of_data_message() {
        // ---
        let mut r = DataBlockReader::from_slice(&[]);
        let err = r.get_double("").unwrap_err();
        assert_eq!(err.to_string(), "reached end of data when expecting double");
    }

    #[test]
    fn test_peek_at_end_is_terminate() {
        // ---
        let r = DataBlockReader::from_slice(&[]);
        assert_eq!(r.peek_type().unwrap(), DataBlockType::Terminate);
    }

    #[test]
    fn test_negative_string_length_is_malformed() {
        // ---
        let mut r = DataBlockReader::from_slice(&[4, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(matches!(r.get_string(""), Err(SbwError::Malformed(_))));
    }

    #[test]
    fn test_huge_array_rejected_before_allocation() {
        // ---
        let mut bytes = vec![5u8, 1, 1, 0, 0, 0];
        bytes.extend_from_slice(&i32::MAX.to_le_bytes());
        let mut r = DataBlockReader::from_slice(&bytes);
        assert!(matches!(r.get_array(""), Err(SbwError::EndOfData { .. })));
    }

    #[test]
    fn test_skip_matches_decode_length() {
        // ---
        let values = sample_values();
        let bytes = encode(&values);
        let mut r = DataBlockReader::new(bytes.clone());
        let mut skipped = Vec::new();
        while !r.is_at_end() {
            skipped.push(r.skip_object().unwrap());
        }
        let expected: Vec<_> = values.iter().map(Value::data_type).collect();
        assert_eq!(skipped, expected);
        assert_eq!(r.position(), bytes.len());
    }

    #[test]
    fn test_array_holding_a_list() {
        // ---
        let mut bytes = vec![5u8, 6];
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.push(DataBlockType::Integer.tag());
        bytes.extend_from_slice(&42i32.to_le_bytes());

        let mut r = DataBlockReader::from_slice(&bytes);
        let value = r.get_value("").unwrap();
        assert_eq!(
            value,
            Value::Array(Array::one_dim(ArrayData::List(vec![vec![Value::Integer(42)]])))
        );
        assert!(r.is_at_end());

        let mut r = DataBlockReader::from_slice(&bytes);
        assert_eq!(r.skip_object().unwrap(), DataBlockType::Array);
        assert!(r.is_at_end());
    }

    #[test]
    fn test_nested_array_prefixes_fail() {
        // ---
        let nested = Value::Array(Array::one_dim(ArrayData::Array(vec![
            Array::one_dim(ArrayData::Integer(vec![1, 2, 3])),
            Array::one_dim(ArrayData::List(vec![vec![Value::String("deep".into())]])),
        ])));
        let full = encode(&[nested]);
        for cut in 0..full.len() {
            assert!(DataBlockReader::new(full.slice(..cut)).get_value("").is_err());
            assert!(DataBlockReader::new(full.slice(..cut)).skip_object().is_err());
        }
    }

    #[test]
    fn test_huge_array_of_lists_rejected_before_allocation() {
        // ---
        let mut bytes = vec![5u8, 6, 1, 0, 0, 0];
        bytes.extend_from_slice(&(i32::MAX / 2).to_le_bytes());
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        let mut r = DataBlockReader::from_slice(&bytes);
        assert!(matches!(r.get_array(""), Err(SbwError::EndOfData { .. })));
    }

    #[test]
    fn test_get_all_stops_at_terminate() {
        // ---
        let mut w = DataBlockWriter::new();
        w.add_integer(42).add_string("x");
        let mut bytes = w.as_bytes().to_vec();
        bytes.push(DataBlockType::Terminate.tag());
        bytes.push(DataBlockType::Integer.tag());

        let mut r = DataBlockReader::from_slice(&bytes);
        assert_eq!(
            r.get_all("").unwrap(),
            vec![Value::Integer(42), Value::String("x".into())]
        );
        assert_eq!(r.remaining(), 1);
    }
}
