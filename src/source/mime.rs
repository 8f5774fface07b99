//! Content-based MIME type detection from a file's leading bytes.

use std::io::{self, Read};

use crate::util::read_up_to;

/// How many leading bytes are examined.  Large enough to see the tar magic at offset 257.
pub const SNIFF_LEN: usize = 3072;

pub const OCTET_STREAM: &str = "application/octet-stream";
pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Reads up to [`SNIFF_LEN`] bytes from `reader` and detects their MIME type.
pub fn sniff_reader(reader: &mut impl Read) -> io::Result<&'static str> {
    let mut buf = vec![0u8; SNIFF_LEN];
    let n = read_up_to(reader, &mut buf)?;
    Ok(sniff(&buf[..n]))
}

/// Detects the MIME type of content starting with `header`.
pub fn sniff(header: &[u8]) -> &'static str {
    match header {
        [0x7f, b'E', b'L', b'F', ..] => elf(header),
        [0xfe, 0xed, 0xfa, 0xce | 0xcf, ..] | [0xce | 0xcf, 0xfa, 0xed, 0xfe, ..] => {
            "application/x-mach-binary"
        }
        [0xca, 0xfe, 0xba, 0xbe, a, b, c, d, ..] => {
            // fat Mach-O binaries share the magic with class files; the architecture count is small
            match u32::from_be_bytes([*a, *b, *c, *d]) > 30 {
                true => "application/x-java-applet",
                false => "application/x-mach-binary",
            }
        }
        [b'M', b'Z', ..] => "application/vnd.microsoft.portable-executable",
        [b'P', b'K', 0x03, 0x04, ..] => zip(header),
        [b'P', b'K', 0x05, 0x06, ..] => "application/zip",
        [0x1f, 0x8b, ..] => "application/gzip",
        [b'B', b'Z', b'h', ..] => "application/x-bzip2",
        [0xfd, b'7', b'z', b'X', b'Z', 0x00, ..] => "application/x-xz",
        [0x28, 0xb5, 0x2f, 0xfd, ..] => "application/zstd",
        [0x00, b'a', b's', b'm', ..] => "application/wasm",
        _ if is_tar(header) => "application/x-tar",
        [b'#', b'!', ..] => shebang(header),
        _ if is_text(header) => TEXT_PLAIN,
        _ => OCTET_STREAM,
    }
}

fn elf(header: &[u8]) -> &'static str {
    let e_type = match (header.get(5), header.get(16..18)) {
        (Some(1), Some(&[lo, hi])) => u16::from_le_bytes([lo, hi]),
        (Some(2), Some(&[hi, lo])) => u16::from_be_bytes([hi, lo]),
        _ => 0,
    };

    match e_type {
        1 => "application/x-object",
        2 => "application/x-executable",
        3 => "application/x-sharedlib",
        4 => "application/x-coredump",
        _ => "application/x-elf",
    }
}

fn zip(header: &[u8]) -> &'static str {
    // the first local file header's name starts at offset 30
    match header.get(30..39) {
        Some(b"META-INF/") => "application/jar",
        _ => "application/zip",
    }
}

fn is_tar(header: &[u8]) -> bool {
    matches!(header.get(257..262), Some(b"ustar"))
}

fn shebang(header: &[u8]) -> &'static str {
    let line_end = header.iter().position(|&b| b == b'\n').unwrap_or(header.len());
    let line = String::from_utf8_lossy(&header[..line_end]);

    if line.contains("python") {
        "text/x-python"
    } else if line.contains("perl") {
        "text/x-perl"
    } else if line.contains("node") {
        "application/javascript"
    } else {
        "text/x-shellscript"
    }
}

fn is_text(header: &[u8]) -> bool {
    let valid = match std::str::from_utf8(header) {
        Ok(..) => true,
        // a multi-byte sequence cut off by the end of the sniffed region
        Err(e) => e.error_len().is_none(),
    };

    valid
        && !header
            .iter()
            .any(|&b| b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r' | 0x0c | 0x1b))
}
