//! Font metrics and text decoding for glyph placement.
//!
//! Placement only needs advance widths and a way back to Unicode for search.
//! Simple fonts take widths from `/Widths`; composite (Type0) fonts from the
//! descendant's `/W` array. Base-14 fonts without widths fall back to the
//! Helvetica metrics below (Courier is fixed-pitch at 600).

use crate::pdf::{array_of, deref, dict_of, number};
use lopdf::{Dictionary, Document, Object};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

/// Helvetica advance widths for codes 32..=126, in 1/1000 em.
const HELVETICA_ASCII: [u16; 95] = [
    278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278, // ' '..'/'
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, // '0'..'9'
    278, 278, 584, 584, 584, 556, 1015, // ':'..'@'
    667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, // 'A'..'M'
    722, 778, 667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, // 'N'..'Z'
    278, 278, 278, 469, 556, 333, // '['..'`'
    556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, // 'a'..'m'
    556, 556, 556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, // 'n'..'z'
    334, 260, 334, 584, // '{'..'~'
];

/// Width of a Helvetica glyph for a single-byte code, in 1/1000 em.
pub fn helvetica_width(code: u32) -> f64 {
    match code {
        32..=126 => f64::from(HELVETICA_ASCII[(code - 32) as usize]),
        _ => 556.0,
    }
}

/// Vertical glyph extent as a fraction of the font size.
pub const ASCENT: f64 = 0.8;
pub const DESCENT: f64 = -0.2;

#[derive(Debug, Clone)]
enum WidthSource {
    Simple {
        first_char: u32,
        widths: Vec<f64>,
        missing: f64,
    },
    Composite {
        widths: HashMap<u32, f64>,
        default: f64,
    },
    Helvetica,
    Monospace,
}

/// Metrics and decoding for one font resource.
#[derive(Debug, Clone)]
pub struct FontMetrics {
    two_byte: bool,
    widths: WidthSource,
    to_unicode: HashMap<u32, String>,
}

impl Default for FontMetrics {
    fn default() -> Self {
        Self {
            two_byte: false,
            widths: WidthSource::Helvetica,
            to_unicode: HashMap::new(),
        }
    }
}

impl FontMetrics {
    /// Read metrics from a font dictionary.
    pub fn load(doc: &Document, font: &Dictionary) -> Self {
        let subtype = name(doc, font.get(b"Subtype").ok());
        let base_font = name(doc, font.get(b"BaseFont").ok()).unwrap_or_default();
        let to_unicode = font
            .get(b"ToUnicode")
            .ok()
            .and_then(|o| deref(doc, o))
            .and_then(|o| match o {
                Object::Stream(s) => Some(
                    s.decompressed_content()
                        .unwrap_or_else(|_| s.content.clone()),
                ),
                _ => None,
            })
            .map(|data| parse_to_unicode(&data))
            .unwrap_or_default();

        if subtype.as_deref() == Some("Type0") {
            let descendant = font
                .get(b"DescendantFonts")
                .ok()
                .and_then(|o| array_of(doc, o))
                .and_then(|a| a.first())
                .and_then(|o| dict_of(doc, o));
            let (widths, default) = descendant
                .map(|d| composite_widths(doc, d))
                .unwrap_or_else(|| (HashMap::new(), 1000.0));
            return Self {
                two_byte: true,
                widths: WidthSource::Composite { widths, default },
                to_unicode,
            };
        }

        let widths = font
            .get(b"Widths")
            .ok()
            .and_then(|o| array_of(doc, o))
            .map(|a| {
                a.iter()
                    .map(|o| deref(doc, o).and_then(number).unwrap_or(0.0))
                    .collect::<Vec<f64>>()
            });
        let widths = match widths {
            Some(widths) if !widths.is_empty() => {
                let first_char = font
                    .get(b"FirstChar")
                    .ok()
                    .and_then(|o| deref(doc, o))
                    .and_then(number)
                    .unwrap_or(0.0) as u32;
                let missing = font
                    .get(b"FontDescriptor")
                    .ok()
                    .and_then(|o| dict_of(doc, o))
                    .and_then(|d| d.get(b"MissingWidth").ok())
                    .and_then(number)
                    .unwrap_or(0.0);
                WidthSource::Simple {
                    first_char,
                    widths,
                    missing,
                }
            }
            _ if base_font.contains("Courier") => WidthSource::Monospace,
            _ => WidthSource::Helvetica,
        };
        Self {
            two_byte: false,
            widths,
            to_unicode,
        }
    }

    pub fn is_two_byte(&self) -> bool {
        self.two_byte
    }

    /// Split a shown string into character codes.
    pub fn codes(&self, bytes: &[u8]) -> Vec<(u32, Vec<u8>)> {
        if self.two_byte {
            bytes
                .chunks(2)
                .map(|c| {
                    let code = c.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
                    (code, c.to_vec())
                })
                .collect()
        } else {
            bytes.iter().map(|b| (u32::from(*b), vec![*b])).collect()
        }
    }

    /// Advance width for `code`, in 1/1000 text-space units.
    pub fn width(&self, code: u32) -> f64 {
        match &self.widths {
            WidthSource::Simple {
                first_char,
                widths,
                missing,
            } => code
                .checked_sub(*first_char)
                .and_then(|i| widths.get(i as usize).copied())
                .unwrap_or(*missing),
            WidthSource::Composite { widths, default } => {
                widths.get(&code).copied().unwrap_or(*default)
            }
            WidthSource::Helvetica => helvetica_width(code),
            WidthSource::Monospace => 600.0,
        }
    }

    /// Unicode text for `code`: ToUnicode first, else Latin-1 for simple fonts.
    pub fn decode(&self, code: u32) -> String {
        if let Some(s) = self.to_unicode.get(&code) {
            return s.clone();
        }
        if self.two_byte {
            return char::REPLACEMENT_CHARACTER.to_string();
        }
        win_ansi_to_char(code as u8).to_string()
    }
}

fn name(doc: &Document, obj: Option<&Object>) -> Option<String> {
    match obj.and_then(|o| deref(doc, o))? {
        Object::Name(n) => Some(String::from_utf8_lossy(n).into_owned()),
        _ => None,
    }
}

/// Parse a CIDFont `/W` array: `c [w1 w2 ...]` and `cfirst clast w` forms.
fn composite_widths(doc: &Document, cid_font: &Dictionary) -> (HashMap<u32, f64>, f64) {
    let default = cid_font
        .get(b"DW")
        .ok()
        .and_then(|o| deref(doc, o))
        .and_then(number)
        .unwrap_or(1000.0);
    let mut widths = HashMap::new();
    let Some(items) = cid_font.get(b"W").ok().and_then(|o| array_of(doc, o)) else {
        return (widths, default);
    };

    let mut i = 0;
    while i < items.len() {
        let Some(first) = deref(doc, &items[i]).and_then(number) else {
            break;
        };
        match items.get(i + 1).and_then(|o| deref(doc, o)) {
            Some(Object::Array(run)) => {
                for (k, w) in run.iter().enumerate() {
                    if let Some(w) = deref(doc, w).and_then(number) {
                        widths.insert(first as u32 + k as u32, w);
                    }
                }
                i += 2;
            }
            Some(last) => {
                let last = number(last).unwrap_or(first);
                let w = items
                    .get(i + 2)
                    .and_then(|o| deref(doc, o))
                    .and_then(number)
                    .unwrap_or(default);
                for code in (first as u32)..=(last as u32) {
                    widths.insert(code, w);
                }
                i += 3;
            }
            None => break,
        }
    }
    (widths, default)
}

static RE_BFCHAR_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)beginbfchar(.*?)endbfchar").unwrap());
static RE_BFRANGE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)beginbfrange(.*?)endbfrange").unwrap());
static RE_PAIR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<([0-9A-Fa-f]+)>\s*<([0-9A-Fa-f]*)>").unwrap());
static RE_RANGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<([0-9A-Fa-f]+)>\s*<([0-9A-Fa-f]+)>\s*<([0-9A-Fa-f]*)>").unwrap()
});

/// Parse the `bfchar` and `bfrange` sections of a ToUnicode CMap.
/// Array-form ranges are skipped.
pub fn parse_to_unicode(data: &[u8]) -> HashMap<u32, String> {
    let text = String::from_utf8_lossy(data);
    let mut map = HashMap::new();

    for block in RE_BFCHAR_BLOCK.captures_iter(&text) {
        for pair in RE_PAIR.captures_iter(&block[1]) {
            if let (Some(code), Some(dst)) = (hex_u32(&pair[1]), utf16_hex(&pair[2])) {
                map.insert(code, dst);
            }
        }
    }

    for block in RE_BFRANGE_BLOCK.captures_iter(&text) {
        for range in RE_RANGE.captures_iter(&block[1]) {
            let (Some(lo), Some(hi), Some(start)) =
                (hex_u32(&range[1]), hex_u32(&range[2]), hex_u32(&range[3]))
            else {
                continue;
            };
            if hi < lo || hi - lo > 0xFFFF {
                continue;
            }
            for (offset, code) in (lo..=hi).enumerate() {
                if let Some(c) = char::from_u32(start + offset as u32) {
                    map.insert(code, c.to_string());
                }
            }
        }
    }
    map
}

fn hex_u32(s: &str) -> Option<u32> {
    u32::from_str_radix(s, 16).ok()
}

fn utf16_hex(s: &str) -> Option<String> {
    let units: Vec<u16> = s
        .as_bytes()
        .chunks(4)
        .filter_map(|c| std::str::from_utf8(c).ok())
        .filter_map(|c| u16::from_str_radix(c, 16).ok())
        .collect();
    String::from_utf16(&units).ok()
}

/// Windows-1252 high range; everything else maps straight to Latin-1.
const CP1252_80_9F: [char; 32] = [
    '€', '\u{81}', '‚', 'ƒ', '„', '…', '†', '‡', 'ˆ', '‰', 'Š', '‹', 'Œ', '\u{8D}', 'Ž', '\u{8F}',
    '\u{90}', '‘', '’', '“', '”', '•', '–', '—', '˜', '™', 'š', '›', 'œ', '\u{9D}', 'ž', 'Ÿ',
];

pub fn win_ansi_to_char(b: u8) -> char {
    match b {
        0x80..=0x9F => CP1252_80_9F[(b - 0x80) as usize],
        _ => char::from(b),
    }
}

/// Encode text for a WinAnsi base-14 font. Polish letters outside the code
/// page are transliterated; anything else unrepresentable becomes `?`.
pub fn encode_win_ansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| {
            let c = transliterate(c);
            if (c as u32) < 0x80 || ((c as u32) >= 0xA0 && (c as u32) <= 0xFF) {
                return c as u8;
            }
            CP1252_80_9F
                .iter()
                .position(|&x| x == c)
                .map(|i| 0x80 + i as u8)
                .unwrap_or(b'?')
        })
        .collect()
}

fn transliterate(c: char) -> char {
    match c {
        'ą' => 'a',
        'ć' => 'c',
        'ę' => 'e',
        'ł' => 'l',
        'ń' => 'n',
        'ś' => 's',
        'ź' | 'ż' => 'z',
        'Ą' => 'A',
        'Ć' => 'C',
        'Ę' => 'E',
        'Ł' => 'L',
        'Ń' => 'N',
        'Ś' => 'S',
        'Ź' | 'Ż' => 'Z',
        other => other,
    }
}
