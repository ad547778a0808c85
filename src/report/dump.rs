//! Hex dumps of leaked block contents.
//!
//! Each row covers 16 bytes: the hex values in groups of four, then the same
//! bytes as text. Rows are padded out to 16 bytes.

const ROW: usize = 16;

/// Rows of `data` with an ASCII column.
///
/// Graphic ASCII characters are shown as is; anything else, padding
/// included, becomes `.`.
pub fn ascii_rows(data: &[u8]) -> Vec<String> {
    data.chunks(ROW)
        .map(|chunk| {
            let mut text = String::with_capacity(ROW + 1);
            for index in 0..ROW {
                if index == 8 {
                    text.push(' ');
                }
                let byte = chunk.get(index).copied().unwrap_or(b'.');
                text.push(if byte.is_ascii_graphic() { byte as char } else { '.' });
            }
            format!("    {}    {text}", hex_column(chunk))
        })
        .collect()
}

/// Rows of `data` with a UTF-16 column, one character per little-endian
/// code unit.
///
/// Nul and space units, padding and units that are not printable on their
/// own become `.`.
pub fn unicode_rows(data: &[u8]) -> Vec<String> {
    data.chunks(ROW)
        .map(|chunk| {
            let text: String = (0..ROW / 2)
                .map(|unit| {
                    let Some(&low) = chunk.get(unit * 2) else {
                        return '.';
                    };
                    let high = chunk.get(unit * 2 + 1).copied().unwrap_or(0);
                    let code = u16::from_le_bytes([low, high]);
                    match char::from_u32(code as u32) {
                        Some(c) if code != 0x20 && !c.is_control() => c,
                        _ => '.',
                    }
                })
                .collect();
            format!("    {}    {text}", hex_column(chunk))
        })
        .collect()
}

fn hex_column(chunk: &[u8]) -> String {
    let mut hex = String::with_capacity(57);
    for index in 0..ROW {
        match chunk.get(index) {
            Some(byte) => hex.push_str(&format!("{byte:02X} ")),
            None => hex.push_str("   "),
        }
        if index % 4 == 3 && index != ROW - 1 {
            hex.push_str("   ");
        }
    }
    hex
}
