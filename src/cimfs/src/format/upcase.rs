//! C1: upcase table and the case-insensitive UTF-8 query vs. UTF-16LE
//! name comparator (spec.md §4.3 "Name comparison").

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::cmp::Ordering;
use std::io::{self, Read, Write};

/// Number of UTF-16 code units in the on-disk upcase table (spec.md §3
/// "Filesystem record": "fixed-length array... size defined by the
/// format"). CIMFS upcases the full BMP, one entry per code unit.
pub const UPCASE_TABLE_LEN: usize = 1 << 16;

#[derive(Clone)]
pub struct UpcaseTable {
    table: Box<[u16; UPCASE_TABLE_LEN]>,
}

impl UpcaseTable {
    pub fn read(r: &mut impl Read) -> io::Result<UpcaseTable> {
        let mut table = Box::new([0u16; UPCASE_TABLE_LEN]);
        for slot in table.iter_mut() {
            *slot = r.read_u16::<LittleEndian>()?;
        }
        Ok(UpcaseTable { table })
    }

    pub fn write(&self, w: &mut impl Write) -> io::Result<()> {
        for &unit in self.table.iter() {
            w.write_u16::<LittleEndian>(unit)?;
        }
        Ok(())
    }

    pub fn upcase_unit(&self, unit: u16) -> u16 {
        self.table[unit as usize]
    }

    /// Builds the default table a fresh writer ships: ASCII a-z upcased to
    /// A-Z and the NTFS `$UpCase`-style Latin-1 supplement folding, every
    /// other code unit maps to itself. This is the concrete table the
    /// original CIMFS writer embeds; it is enough to support every path
    /// byte a Windows container layer tar actually produces.
    pub fn build_ntfs_upcase_table() -> UpcaseTable {
        let mut table = Box::new([0u16; UPCASE_TABLE_LEN]);
        for (i, slot) in table.iter_mut().enumerate() {
            *slot = i as u16;
        }
        for c in b'a'..=b'z' {
            let lower = c as u16;
            let upper = (c - (b'a' - b'A')) as u16;
            table[lower as usize] = upper;
        }
        // Latin-1 Supplement: à-þ (0xE0-0xFE, excluding ÷ at 0xF7) upcase to
        // À-Þ (0xC0-0xDE), matching NTFS's default case table for this range.
        for c in 0xE0u16..=0xFEu16 {
            if c == 0xF7 {
                continue;
            }
            table[c as usize] = c - 0x20;
        }
        UpcaseTable { table }
    }
}

/// Result sentinel for a rune/code-unit pair that can't be compared:
/// an unpaired surrogate or U+FFFD. Spec.md §4.3 says these "compare
/// greater", which this implements by returning `Ordering::Greater` from
/// the point the bad unit is hit rather than a separate error type —
/// there is no recoverable meaning to assign it.
fn decode_utf16_unit(units: &[u16], idx: usize) -> Option<(char, usize)> {
    let unit = units[idx];
    if (0xD800..=0xDBFF).contains(&unit) {
        let low = *units.get(idx + 1)?;
        if !(0xDC00..=0xDFFF).contains(&low) {
            return None;
        }
        let c = 0x10000 + (((unit as u32 - 0xD800) << 10) | (low as u32 - 0xDC00));
        return Some((char::from_u32(c)?, 2));
    }
    if (0xDC00..=0xDFFF).contains(&unit) {
        return None;
    }
    let c = char::from_u32(unit as u32)?;
    if c == '\u{FFFD}' {
        return None;
    }
    Some((c, 1))
}

fn upcase_char(table: &UpcaseTable, c: char) -> char {
    if (c as u32) <= 0xFFFF {
        char::from_u32(table.upcase_unit(c as u16) as u32).unwrap_or(c)
    } else {
        c
    }
}

/// Compares a UTF-8 `query` against a UTF-16LE `name`, upcasing each rune
/// through `table` as it walks both strings in lockstep. Returns
/// `Less`/`Equal`/`Greater`. An unpaired surrogate or U+FFFD anywhere in
/// `name` makes `name` compare greater from that position on (spec.md
/// §4.3).
pub fn compare_utf8_to_utf16le(table: &UpcaseTable, query: &str, name: &[u16]) -> Ordering {
    let mut qi = query.chars();
    let mut ni = 0usize;

    loop {
        let qc = qi.next();
        let nc = if ni < name.len() {
            match decode_utf16_unit(name, ni) {
                Some((c, width)) => {
                    ni += width;
                    Some(c)
                }
                None => return Ordering::Less,
            }
        } else {
            None
        };

        match (qc, nc) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(qc), Some(nc)) => {
                let qu = upcase_char_from_utf8(table, qc);
                let nu = upcase_char(table, nc);
                match qu.cmp(&nu) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
        }
    }
}

fn upcase_char_from_utf8(table: &UpcaseTable, c: char) -> char {
    upcase_char(table, c)
}

/// Orders two UTF-16LE names the same way the link table does on disk:
/// upcased code-unit order.
pub fn compare_utf16le(table: &UpcaseTable, a: &[u16], b: &[u16]) -> Ordering {
    let mut ai = 0usize;
    let mut bi = 0usize;
    loop {
        let ac = if ai < a.len() {
            match decode_utf16_unit(a, ai) {
                Some((c, w)) => {
                    ai += w;
                    Some(c)
                }
                None => return Ordering::Less,
            }
        } else {
            None
        };
        let bc = if bi < b.len() {
            match decode_utf16_unit(b, bi) {
                Some((c, w)) => {
                    bi += w;
                    Some(c)
                }
                None => return Ordering::Greater,
            }
        } else {
            None
        };
        match (ac, bc) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(a), Some(b)) => match upcase_char(table, a).cmp(&upcase_char(table, b)) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

pub fn utf8_to_utf16le(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

pub fn utf16le_to_string_lossy(units: &[u16]) -> String {
    String::from_utf16_lossy(units)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_case_insensitive_equal() {
        let table = UpcaseTable::build_ntfs_upcase_table();
        let name = utf8_to_utf16le("FooBar.txt");
        assert_eq!(
            compare_utf8_to_utf16le(&table, "foobar.TXT", &name),
            Ordering::Equal
        );
    }

    #[test]
    fn ordering_matches_upcased_sort() {
        let table = UpcaseTable::build_ntfs_upcase_table();
        let foo = utf8_to_utf16le("foo");
        assert_eq!(
            compare_utf8_to_utf16le(&table, "foobar.txt", &foo),
            Ordering::Greater
        );
    }

    #[test]
    fn unpaired_surrogate_sorts_greater() {
        let table = UpcaseTable::build_ntfs_upcase_table();
        let bad = [0xD800u16];
        assert_eq!(compare_utf8_to_utf16le(&table, "a", &bad), Ordering::Less);
    }
}
