// Field encoding used for both the stored payload of a record and the entries
// of spill files.
//
// Every field is written as its raw bytes with 0x00 escaped to [0x00, 0xff],
// and consecutive fields are separated by [0x00, 0x01]. Since an escaped field
// can never contain the separator, a reader can split the buffer without
// knowing the field widths up front.

use anyhow::{bail, Context};
use bytes::Bytes;

const SEPARATOR: [u8; 2] = [0x00, 0x01];
const ESCAPED_00: [u8; 2] = [0x00, 0xff];

fn copy_escaped(mut from: &[u8], to: &mut Vec<u8>) {
    while !from.is_empty() {
        match from.iter().position(|x| *x == 0x00) {
            Some(idx) => {
                to.extend(&from[..idx + 1]);
                to.push(0xff);
                from = &from[(idx + 1)..];
            }
            None => {
                to.extend(from);
                return;
            }
        }
    }
}

fn copy_unescaped(mut from: &[u8], to: &mut Vec<u8>) {
    while !from.is_empty() {
        match from.windows(2).position(|w| w == ESCAPED_00) {
            Some(idx) => {
                to.extend(&from[..idx + 1]);
                from = &from[(idx + 2)..];
            }
            None => {
                to.extend(from);
                return;
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct FieldWriter {
    buf: Vec<u8>,
    fields: usize,
}

impl FieldWriter {
    pub fn new() -> Self {
        FieldWriter::default()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.fields = 0;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buf)
    }

    pub fn field(&mut self, data: &[u8]) {
        if self.fields > 0 {
            self.buf.extend(SEPARATOR);
        }
        copy_escaped(data, &mut self.buf);
        self.fields += 1;
    }
}

pub struct FieldReader<'a> {
    buf: &'a [u8],
    from: usize,
    scratch: Vec<u8>,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        FieldReader {
            buf,
            from: 0,
            scratch: Vec::new(),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.from > self.buf.len()
    }

    pub fn next_field(&mut self) -> anyhow::Result<&[u8]> {
        if self.from > self.buf.len() {
            bail!("record truncated: no field at offset {}", self.from);
        }
        let rest = &self.buf[self.from..];
        let split_position = rest
            .windows(2)
            .position(|x| x == SEPARATOR)
            .unwrap_or(rest.len());

        self.scratch.clear();
        copy_unescaped(&rest[..split_position], &mut self.scratch);
        self.from += split_position + 2;

        Ok(&self.scratch)
    }

    fn fixed<const N: usize>(&mut self) -> anyhow::Result<[u8; N]> {
        let field = self.next_field()?;
        field
            .try_into()
            .with_context(|| format!("expected a {} byte field, found {} bytes", N, field.len()))
    }
}

pub trait Encode {
    fn encode(&self, w: &mut FieldWriter);
}

pub trait Decode: Sized {
    fn decode(r: &mut FieldReader<'_>) -> anyhow::Result<Self>;
}

macro_rules! fixed_width {
    ($($t:ty),*) => {
        $(
            impl Encode for $t {
                fn encode(&self, w: &mut FieldWriter) {
                    w.field(&self.to_le_bytes())
                }
            }

            impl Decode for $t {
                fn decode(r: &mut FieldReader<'_>) -> anyhow::Result<Self> {
                    Ok(<$t>::from_le_bytes(r.fixed()?))
                }
            }
        )*
    };
}

fixed_width!(u8, u32, u64, i64, u128);

impl Encode for f64 {
    fn encode(&self, w: &mut FieldWriter) {
        self.to_bits().encode(w)
    }
}

impl Decode for f64 {
    fn decode(r: &mut FieldReader<'_>) -> anyhow::Result<Self> {
        Ok(f64::from_bits(u64::decode(r)?))
    }
}

impl Encode for String {
    fn encode(&self, w: &mut FieldWriter) {
        w.field(self.as_bytes())
    }
}

impl Decode for String {
    fn decode(r: &mut FieldReader<'_>) -> anyhow::Result<Self> {
        Ok(String::from_utf8(r.next_field()?.to_vec())?)
    }
}

impl Encode for Bytes {
    fn encode(&self, w: &mut FieldWriter) {
        w.field(self)
    }
}

impl Decode for Bytes {
    fn decode(r: &mut FieldReader<'_>) -> anyhow::Result<Self> {
        Ok(Bytes::copy_from_slice(r.next_field()?))
    }
}

impl<A> Encode for &A
where
    A: Encode,
{
    fn encode(&self, w: &mut FieldWriter) {
        (*self).encode(w)
    }
}

impl<A, B> Encode for (A, B)
where
    A: Encode,
    B: Encode,
{
    fn encode(&self, w: &mut FieldWriter) {
        self.0.encode(w);
        self.1.encode(w);
    }
}

impl<A, B> Decode for (A, B)
where
    A: Decode,
    B: Decode,
{
    fn decode(r: &mut FieldReader<'_>) -> anyhow::Result<Self> {
        let a = A::decode(r)?;
        let b = B::decode(r)?;
        Ok((a, b))
    }
}

impl<A> Encode for Option<A>
where
    A: Encode,
{
    fn encode(&self, w: &mut FieldWriter) {
        match self {
            None => w.field(&[0]),
            Some(v) => {
                w.field(&[1]);
                v.encode(w);
            }
        }
    }
}

impl<A> Decode for Option<A>
where
    A: Decode,
{
    fn decode(r: &mut FieldReader<'_>) -> anyhow::Result<Self> {
        match r.fixed::<1>()? {
            [0] => Ok(None),
            [1] => Ok(Some(A::decode(r)?)),
            [tag] => bail!("invalid option tag {}", tag),
        }
    }
}
