//! Little-endian field cursors for fixed-size records.
//!
//! Records are never accessed through pointer casts; every field is written
//! and read through these cursors with explicit endianness.

/// Sequential writer over a record payload.
pub struct FieldWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> FieldWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        buf.fill(0);
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> &mut [u8] {
        let start = self.pos;
        self.pos += n;
        &mut self.buf[start..start + n]
    }

    pub fn put_u8(&mut self, v: u8) {
        self.take(1)[0] = v;
    }

    pub fn put_u32(&mut self, v: u32) {
        self.take(4).copy_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.take(4).copy_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.take(8).copy_from_slice(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.take(8).copy_from_slice(&v.to_le_bytes());
    }

    /// Write a NUL-terminated string into a `len` byte field, truncating on
    /// a character boundary so the last byte always stays NUL.
    pub fn put_str(&mut self, s: &str, len: usize) {
        let field = self.take(len);
        let mut end = s.len().min(len.saturating_sub(1));
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        field[..end].copy_from_slice(&s.as_bytes()[..end]);
    }

    pub fn skip(&mut self, n: usize) {
        self.take(n);
    }
}

/// Sequential reader over a record payload.
pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> &'a [u8] {
        let start = self.pos;
        self.pos += n;
        &self.buf[start..start + n]
    }

    pub fn get_u8(&mut self) -> u8 {
        self.take(1)[0]
    }

    pub fn get_u32(&mut self) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4));
        u32::from_le_bytes(b)
    }

    pub fn get_i32(&mut self) -> i32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4));
        i32::from_le_bytes(b)
    }

    pub fn get_u64(&mut self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8));
        u64::from_le_bytes(b)
    }

    pub fn get_i64(&mut self) -> i64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8));
        i64::from_le_bytes(b)
    }

    pub fn get_str(&mut self, len: usize) -> String {
        let field = self.take(len);
        let end = field.iter().position(|&b| b == 0).unwrap_or(len);
        String::from_utf8_lossy(&field[..end]).into_owned()
    }

    pub fn skip(&mut self, n: usize) {
        self.take(n);
    }
}
