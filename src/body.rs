//! Boundary-delimited body streaming
use crate::Error;
use crate::line::LineReader;
use memchr::memmem;
use std::io::Read;

/// The byte classes that may legally follow a boundary token on its line
const DELIM_TAIL: &[u8] = &[b' ', b'\t', b'\r', b'\n', b'-'];

/// Streams a part body out of the buffered source
///
/// The stream is composed of the body line the tree walker has already
/// consumed followed by the raw source bytes up to (but not including) the
/// next `--boundary` delimiter line, which is left in the source for the
/// walker to pick up; without a boundary the source is drained to EOF
///
/// Delimiter candidates are never split across refills: when the window
/// ends with a proper prefix of the delimiter, only the bytes before it are
/// released until more data disambiguates the match
pub struct BodyReader<'a, R: Read> {
    src: &'a mut LineReader<R>,
    delim: Option<Vec<u8>>,
    head: Vec<u8>,
    head_pos: usize,
    done: bool,
}

impl<'a, R: Read> BodyReader<'a, R> {
    pub(crate) fn new(src: &'a mut LineReader<R>, boundary: Option<&str>, head: Vec<u8>) -> Self {
        let delim = boundary.map(|bound| {
            let mut delim = Vec::with_capacity(bound.len() + 2);
            delim.extend_from_slice(b"--");
            delim.extend_from_slice(bound.as_bytes());
            delim
        });
        Self {
            src,
            delim,
            head,
            head_pos: 0,
            done: false,
        }
    }
}

impl<R: Read> Read for BodyReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        // The head line goes out first
        if self.head_pos < self.head.len() {
            let n = (self.head.len() - self.head_pos).min(buf.len());
            buf[0..n].copy_from_slice(&self.head[self.head_pos..(self.head_pos + n)]);
            self.head_pos += n;
            return Ok(n);
        }
        if self.done {
            return Ok(0);
        }

        let delim: &[u8] = match self.delim {
            Some(ref delim) => delim,
            None => {
                // Unbounded body, plain drain to EOF
                let window = self.src.peek(1)?;
                if window.is_empty() {
                    self.done = true;
                    return Ok(0);
                }
                let n = window.len().min(buf.len());
                buf[0..n].copy_from_slice(&window[0..n]);
                self.src.consume(n);
                return Ok(n);
            }
        };

        let mut want = delim.len() + 2;
        loop {
            self.src.fill_to(want)?;
            let src_eof = self.src.is_eof();
            let window = self.src.window();
            if window.is_empty() {
                // Upstream ran dry before the delimiter
                return Err(Error::UnexpectedEof.into_io());
            }

            // Search for the delimiter; `safe` is how much may be released
            let mut safe = window.len();
            let mut terminated = false;
            let mut grow = false;
            let mut from = 0;
            while let Some(pos) = memmem::find(&window[from..], delim) {
                let pos = from + pos;
                match window.get(pos + delim.len()) {
                    Some(b) if DELIM_TAIL.contains(b) => {
                        safe = pos;
                        terminated = true;
                        break;
                    }
                    Some(_) => {
                        // Not a delimiter after all
                        from = pos + 1;
                    }
                    None if src_eof => {
                        // The delimiter butts against EOF
                        safe = pos;
                        terminated = true;
                        break;
                    }
                    None => {
                        // The follow-up byte is still upstream
                        if pos > 0 {
                            safe = pos;
                        } else {
                            grow = true;
                        }
                        break;
                    }
                }
            }
            if !terminated && !grow && safe == window.len() {
                // Withhold any tail that could still become a delimiter
                let mut hold = 0;
                for l in (1..delim.len().min(window.len() + 1)).rev() {
                    if window[(window.len() - l)..] == delim[0..l] {
                        hold = l;
                        break;
                    }
                }
                safe = window.len() - hold;
                if safe == 0 {
                    if src_eof {
                        return Err(Error::UnexpectedEof.into_io());
                    }
                    grow = true;
                }
            }
            if grow {
                want = window.len() + delim.len() + 2;
                continue;
            }
            if terminated && safe == 0 {
                // The delimiter line is next; it stays in the source
                self.done = true;
                return Ok(0);
            }
            let n = safe.min(buf.len());
            buf[0..n].copy_from_slice(&window[0..n]);
            self.src.consume(n);
            return Ok(n);
        }
    }
}
