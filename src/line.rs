//! Binary line reader
use crate::{CR, Error, LF};
use std::io::Read;

/// The maximum length of a logical line, terminator included
pub const MAX_LINE_LEN: usize = 4000;
/// The size of the internal buffer
const BUFSIZ: usize = 50 * 1024;

/// The line terminator observed on a logical line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eol {
    /// The line ended with CRLF
    CrLf,
    /// The line ended with a bare LF
    Lf,
    /// The line ended with the stream (no terminator)
    None,
}

impl Eol {
    /// The terminator bytes
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Eol::CrLf => b"\r\n",
            Eol::Lf => b"\n",
            Eol::None => b"",
        }
    }
}

/// A buffered "mail line" reader, wraps any `Read`
///
/// Lines break on LF; the terminator form is CRLF when the byte before the
/// LF is a CR, LF otherwise
pub struct LineReader<R: Read> {
    r: R,
    buf: Box<[u8]>,
    start: usize,
    end: usize,
    eof: bool,
}

impl<R: Read> LineReader<R> {
    /// Creates the line reader
    pub fn new(r: R) -> Self {
        Self {
            r,
            buf: vec![0u8; BUFSIZ].into_boxed_slice(),
            start: 0,
            end: 0,
            eof: false,
        }
    }

    fn fill_buf(&mut self) -> Result<(), std::io::Error> {
        if self.start > 0 {
            // memmove
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        if self.end == self.buf.len() {
            return Ok(());
        }
        loop {
            let read = match self.r.read(&mut self.buf[self.end..]) {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if read == 0 {
                self.eof = true;
            }
            self.end += read;
            break;
        }
        Ok(())
    }

    /// Returns the position of the first LF within the line length cap
    fn find_lf(&self) -> Option<usize> {
        let window = &self.buf[self.start..self.end];
        memchr::memchr(LF, &window[0..window.len().min(MAX_LINE_LEN)])
    }

    /// Reads and returns a full mail line (terminator included) along with
    /// the terminator form observed on it
    ///
    /// An empty slice is returned on EOF
    pub fn read_line(&mut self) -> Result<(&[u8], Eol), Error> {
        loop {
            if let Some(pos) = self.find_lf() {
                let eol = if pos > 0 && self.buf[self.start + pos - 1] == CR {
                    Eol::CrLf
                } else {
                    Eol::Lf
                };
                let start = self.start;
                self.start += pos + 1;
                return Ok((&self.buf[start..(start + pos + 1)], eol));
            }
            if self.end - self.start >= MAX_LINE_LEN {
                return Err(Error::MaxLineLength);
            }
            self.fill_buf()?;
            if self.eof {
                // Unterminated remainder (empty at EOF)
                let start = self.start;
                self.start = self.end;
                return Ok((&self.buf[start..self.end], Eol::None));
            }
        }
    }

    /// Buffers at least `want` bytes when upstream can still provide them
    pub(crate) fn fill_to(&mut self, want: usize) -> Result<(), std::io::Error> {
        let want = want.min(self.buf.len());
        while !self.eof && self.end - self.start < want {
            self.fill_buf()?;
        }
        Ok(())
    }

    /// The whole buffered window
    pub(crate) fn window(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// Buffers at least `want` bytes when upstream can still provide them
    /// and returns the whole buffered window
    pub(crate) fn peek(&mut self, want: usize) -> Result<&[u8], std::io::Error> {
        self.fill_to(want)?;
        Ok(self.window())
    }

    /// Discards `n` buffered bytes
    pub(crate) fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.end - self.start);
        self.start += n;
    }

    /// Reports whether upstream is exhausted
    pub(crate) fn is_eof(&self) -> bool {
        self.eof
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_readline() -> Result<(), Error> {
        let data: &[u8] = b"crlf\r\nlf\ncr\rstays\n4\n\n6";
        let mut r = LineReader::new(data);
        assert_eq!(r.read_line()?, (b"crlf\r\n".as_slice(), Eol::CrLf));
        assert_eq!(r.read_line()?, (b"lf\n".as_slice(), Eol::Lf));
        assert_eq!(r.read_line()?, (b"cr\rstays\n".as_slice(), Eol::Lf));
        assert_eq!(r.read_line()?, (b"4\n".as_slice(), Eol::Lf));
        assert_eq!(r.read_line()?, (b"\n".as_slice(), Eol::Lf));
        assert_eq!(r.read_line()?, (b"6".as_slice(), Eol::None));
        assert_eq!(r.read_line()?, (b"".as_slice(), Eol::None));
        assert_eq!(r.read_line()?, (b"".as_slice(), Eol::None));
        Ok(())
    }

    struct LameReader<R: Read>(R);
    impl<R: Read> Read for LameReader<R> {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
            let len = buf.len().min(1);
            self.0.read(&mut buf[0..len])
        }
    }

    #[test]
    fn test_readline_lame() -> Result<(), Error> {
        let data: &[u8] = b"crlf\r\nlf\n\n6";
        let mut r = LineReader::new(LameReader(data));
        assert_eq!(r.read_line()?, (b"crlf\r\n".as_slice(), Eol::CrLf));
        assert_eq!(r.read_line()?, (b"lf\n".as_slice(), Eol::Lf));
        assert_eq!(r.read_line()?, (b"\n".as_slice(), Eol::Lf));
        assert_eq!(r.read_line()?, (b"6".as_slice(), Eol::None));
        assert_eq!(r.read_line()?, (b"".as_slice(), Eol::None));
        Ok(())
    }

    #[test]
    fn test_trailing_newline() -> Result<(), Error> {
        let data: &[u8] = b"line1\nline2\n";
        let mut r = LineReader::new(data);
        assert_eq!(r.read_line()?.0, b"line1\n");
        assert_eq!(r.read_line()?.0, b"line2\n");
        assert_eq!(r.read_line()?.0, b"");
        Ok(())
    }

    #[test]
    fn test_limits() {
        let data = [b'a'; MAX_LINE_LEN - 1].as_ref();
        let mut r = LineReader::new(data);
        assert!(r.read_line().is_ok());

        let data = [b'a'; MAX_LINE_LEN].as_ref();
        let mut r = LineReader::new(data);
        assert!(matches!(r.read_line(), Err(Error::MaxLineLength)));

        // The terminator counts against the cap
        let mut data = vec![b'a'; MAX_LINE_LEN];
        data.push(LF);
        let mut r = LineReader::new(data.as_slice());
        assert!(matches!(r.read_line(), Err(Error::MaxLineLength)));

        let mut data = vec![b'a'; MAX_LINE_LEN - 1];
        data.extend_from_slice(b"\ntail");
        let mut r = LineReader::new(data.as_slice());
        assert!(r.read_line().is_ok());
        assert_eq!(r.read_line().unwrap().0, b"tail");
    }

    #[test]
    fn test_refill() {
        fn test_size(len: usize) {
            let mut data: Vec<u8> = Vec::with_capacity(len + 4);
            while data.len() < len {
                let needed = (len - data.len() - 1).min(MAX_LINE_LEN - 1);
                for _ in 0..needed {
                    data.push(b'a');
                }
                data.push(LF);
            }
            data.extend_from_slice(b"last");
            let mut r = LineReader::new(data.as_slice());
            let mut is_last = false;
            loop {
                let (line, _) = r.read_line().unwrap();
                if line.is_empty() {
                    break;
                }
                is_last = line == b"last";
            }
            assert!(is_last, "refill with len {} failed", len);
        }

        for len in (BUFSIZ - 4)..(BUFSIZ + 4) {
            test_size(len);
        }
    }

    #[test]
    fn test_peek_consume() -> Result<(), std::io::Error> {
        let data: &[u8] = b"0123456789";
        let mut r = LineReader::new(LameReader(data));
        assert_eq!(r.peek(4)?, b"0123");
        r.consume(2);
        assert_eq!(r.peek(4)?, b"2345");
        r.consume(4);
        assert_eq!(r.peek(100)?, b"6789");
        r.consume(4);
        assert_eq!(r.peek(1)?, b"");
        assert!(r.is_eof());
        Ok(())
    }
}
