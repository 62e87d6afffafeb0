//! Structural edits of the decrypted `EncryptedRoot.plist.wipekey` escrow file.
//!
//! The escrow file is an XML property list whose `CryptoUsers` array holds one
//! `<dict>` per enrolled credential. This is not a plist parser: it scans for
//! literal tags, counts nesting depth to find matching end tags, and splices
//! the array so that a single dict survives. Anything it does not recognise is
//! passed through untouched.

use log::debug;
use std::ops::Range;
use uuid::Uuid;

pub const XML_PREFIX: &[u8] = b"<?xml";

pub const USER_TYPE_DISK: u32 = 0x1000_0001;
pub const USER_TYPE_RECOVERY: u32 = 0x1001_0005;
pub const USER_TYPE_REGULAR: u32 = 0x1006_0002;

const KEY_CRYPTO_USERS: &str = "CryptoUsers";
const KEY_USER_TYPE: &str = "UserType";
const KEY_USER_IDENT: &str = "UserIdent";
const TAG_ARRAY: &str = "array";
const TAG_DICT: &str = "dict";

/// One entry of the `CryptoUsers` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoUser {
    /// `0` when the dict carries no parsable `UserType`.
    pub user_type: u32,
    pub user_ident: Option<Uuid>,
}

impl CryptoUser {
    pub fn is_disk_password(&self) -> bool {
        self.user_type == USER_TYPE_DISK
    }
}

/// A located `CryptoUsers` array: `content` starts right after `<array>` and
/// ends at the matching `</array>`.
#[derive(Debug)]
struct UsersArray {
    content: Range<usize>,
    dicts: Vec<(Range<usize>, CryptoUser)>,
}

/// Returns true when the buffer starts with the XML declaration marker.
pub fn is_xml(buf: &[u8]) -> bool {
    buf.starts_with(XML_PREFIX)
}

/// Lists the users in the `CryptoUsers` array, in file order.
pub fn crypto_users(src: &[u8]) -> Vec<CryptoUser> {
    locate_users(text(src))
        .map(|array| array.dicts.into_iter().map(|(_, user)| user).collect())
        .unwrap_or_default()
}

/// Returns a copy of `src` whose `CryptoUsers` array only holds the first user
/// of type `keep_user_type`. Falls back to an identical copy.
pub fn filter_crypto_users(src: &[u8], keep_user_type: u32) -> Vec<u8> {
    let mut out = src.to_vec();
    let len = filter_crypto_users_in_place(&mut out, keep_user_type);
    out.truncate(len);
    out
}

/// In-place variant of [`filter_crypto_users`]. Returns the filtered length;
/// bytes past it are left as they were and are the caller's to clear.
pub fn filter_crypto_users_in_place(buf: &mut [u8], keep_user_type: u32) -> usize {
    let len = buf.len();
    let Some(array) = locate_users(text(buf)) else {
        return len;
    };
    let Some((kept, _)) = array
        .dicts
        .iter()
        .find(|(_, user)| user.user_type == keep_user_type)
    else {
        debug!(
            "no user of type {:#010x} among {} escrow entries, leaving file as is",
            keep_user_type,
            array.dicts.len()
        );
        return len;
    };

    let head = array.content.start;
    let kept_len = kept.len();
    buf.copy_within(kept.clone(), head);
    buf.copy_within(array.content.end..len, head + kept_len);
    let filtered = len - (array.content.len() - kept_len);
    debug!(
        "kept 1 of {} escrow entries, {} -> {} bytes",
        array.dicts.len(),
        len,
        filtered
    );
    filtered
}

/// The scanned text stops at the first NUL byte.
fn text(buf: &[u8]) -> &[u8] {
    match buf.iter().position(|&b| b == 0) {
        Some(nul) => &buf[..nul],
        None => buf,
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn start_tag(tag: &str) -> String {
    format!("<{}>", tag)
}

fn end_tag(tag: &str) -> String {
    format!("</{}>", tag)
}

fn key_tag(key: &str) -> String {
    format!("<key>{}</key>", key)
}

/// Finds the end tag closing an element whose content begins at `from`,
/// skipping any nested elements of the same name. Returns the offset of the
/// end tag.
fn find_matching_end(buf: &[u8], from: usize, tag: &str) -> Option<usize> {
    let open = start_tag(tag);
    let close = end_tag(tag);
    let mut depth = 0usize;
    let mut pos = from;
    loop {
        let close_at = pos + find(&buf[pos..], close.as_bytes())?;
        match find(&buf[pos..close_at], open.as_bytes()) {
            Some(nested) => {
                depth += 1;
                pos += nested + open.len();
            }
            None if depth == 0 => return Some(close_at),
            None => {
                depth -= 1;
                pos = close_at + close.len();
            }
        }
    }
}

fn locate_users(buf: &[u8]) -> Option<UsersArray> {
    let Some(key) = find(buf, key_tag(KEY_CRYPTO_USERS).as_bytes()) else {
        debug!("escrow file has no {} key", KEY_CRYPTO_USERS);
        return None;
    };
    let open = start_tag(TAG_ARRAY);
    let array = key + find(&buf[key..], open.as_bytes())?;
    let content_start = array + open.len();
    let Some(array_end) = find_matching_end(buf, content_start, TAG_ARRAY) else {
        debug!("unterminated {} array", KEY_CRYPTO_USERS);
        return None;
    };

    let dict_open = start_tag(TAG_DICT);
    let dict_close = end_tag(TAG_DICT);
    let within = &buf[..array_end];
    let mut dicts = Vec::new();
    let mut pos = content_start;
    while let Some(offset) = find(&within[pos..], dict_open.as_bytes()) {
        let start = pos + offset;
        let Some(close) = find_matching_end(within, start + dict_open.len(), TAG_DICT) else {
            break;
        };
        let end = close + dict_close.len();
        dicts.push((start..end, parse_user(&within[start..close])));
        pos = end;
    }

    Some(UsersArray {
        content: content_start..array_end,
        dicts,
    })
}

fn parse_user(dict: &[u8]) -> CryptoUser {
    CryptoUser {
        user_type: value_after_key(dict, KEY_USER_TYPE)
            .and_then(parse_decimal)
            .unwrap_or(0),
        user_ident: value_after_key(dict, KEY_USER_IDENT).and_then(parse_guid),
    }
}

/// Text following the first `>` after `<key>name</key>`, i.e. the content of
/// the value element.
fn value_after_key<'a>(dict: &'a [u8], name: &str) -> Option<&'a [u8]> {
    let key = key_tag(name);
    let after = find(dict, key.as_bytes())? + key.len();
    let rest = &dict[after..];
    let gt = rest.iter().position(|&b| b == b'>')?;
    Some(&rest[gt + 1..])
}

fn parse_decimal(s: &[u8]) -> Option<u32> {
    let digits = s.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    s[..digits].iter().try_fold(0u32, |acc, &d| {
        acc.checked_mul(10)?.checked_add(u32::from(d - b'0'))
    })
}

struct Cursor<'a>(&'a [u8]);

impl<'a> Cursor<'a> {
    fn skip_optional(&mut self, c: u8) {
        if self.0.first() == Some(&c) {
            self.0 = &self.0[1..];
        }
    }

    fn expect(&mut self, c: u8) -> Option<()> {
        (self.0.first() == Some(&c)).then(|| self.0 = &self.0[1..])
    }

    fn hex(&mut self, digits: usize) -> Option<u32> {
        if self.0.len() < digits {
            return None;
        }
        let (head, tail) = self.0.split_at(digits);
        let value = head.iter().try_fold(0u32, |acc, &c| {
            let nibble = (c as char).to_digit(16)?;
            Some((acc << 4) | nibble)
        })?;
        self.0 = tail;
        Some(value)
    }
}

/// Parses `8-4-4-4-12` hex groups, case-insensitive, with optional braces.
fn parse_guid(s: &[u8]) -> Option<Uuid> {
    let mut cursor = Cursor(s);
    cursor.skip_optional(b'{');
    let d1 = cursor.hex(8)?;
    cursor.expect(b'-')?;
    let d2 = cursor.hex(4)? as u16;
    cursor.expect(b'-')?;
    let d3 = cursor.hex(4)? as u16;
    cursor.expect(b'-')?;
    let mut d4 = [0u8; 8];
    for (i, byte) in d4.iter_mut().enumerate() {
        if i == 2 {
            cursor.expect(b'-')?;
        }
        *byte = cursor.hex(2)? as u8;
    }
    cursor.skip_optional(b'}');
    Some(Uuid::from_fields(d1, d2, d3, &d4))
}
