/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Format into a caller-supplied byte buffer, for code paths that cannot allocate
//! (QEMU semihosting output, which wants a NUL-terminated `&str`).

use core::{
    cmp::min,
    fmt::{self, Write},
    str,
};

/// Adapter that writes formatted output into a fixed-size byte slice.
pub struct WriteTo<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> WriteTo<'a> {
    /// Wrap a buffer for writing.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    /// Return the bytes written so far as a `str`.
    pub fn as_str(&self) -> &str {
        str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

impl<'a> fmt::Write for WriteTo<'a> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.len >= self.buf.len() {
            return Err(fmt::Error);
        }

        let bytes = s.as_bytes();
        let remaining = self.buf.len() - self.len;
        let to_copy = min(remaining, bytes.len());

        self.buf[self.len..self.len + to_copy].copy_from_slice(&bytes[..to_copy]);
        self.len += to_copy;

        if to_copy < bytes.len() {
            return Err(fmt::Error);
        }

        Ok(())
    }
}

/// Format `args` into `buf` and return the written prefix as a `&str`. Truncates rather than
/// failing if the formatted text does not fit, since the only caller is best-effort console
/// output on a path that must not panic.
pub fn c_show<'a>(buf: &'a mut [u8], args: fmt::Arguments) -> Result<&'a str, fmt::Error> {
    let mut w = WriteTo::new(buf);
    let _ = w.write_fmt(args);
    Ok(w.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn truncates_rather_than_panics() {
        let mut buf = [0u8; 4];
        let s = c_show(&mut buf, format_args!("hello")).unwrap();
        assert_eq!(s, "hell");
    }
}
