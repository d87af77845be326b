//! Conversions between mode bits and the permission strings hierarchical backends speak.

use crate::fs::InodePerms;

const CLASS_BITS: [[InodePerms; 3]; 3] = [
    [
        InodePerms::OWNER_READ,
        InodePerms::OWNER_WRITE,
        InodePerms::OWNER_EXECUTE,
    ],
    [
        InodePerms::GROUP_READ,
        InodePerms::GROUP_WRITE,
        InodePerms::GROUP_EXECUTE,
    ],
    [
        InodePerms::OTHER_READ,
        InodePerms::OTHER_WRITE,
        InodePerms::OTHER_EXECUTE,
    ],
];

const CLASS_NAMES: [&str; 3] = ["user", "group", "other"];
const LETTERS: [char; 3] = ['r', 'w', 'x'];

/// Parse a 9-character permission string such as `rwxr-x---`.
///
/// Any character other than `-` grants the bit at its position. A string of the wrong length
/// yields no permissions.
#[must_use]
pub fn parse_permissions(s: &str) -> InodePerms {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() != 9 {
        return InodePerms::empty();
    }
    let mut perms = InodePerms::empty();
    for (class, bits) in CLASS_BITS.iter().enumerate() {
        for (pos, bit) in bits.iter().enumerate() {
            if chars[class * 3 + pos] != '-' {
                perms |= *bit;
            }
        }
    }
    perms
}

/// Render the 9-character permission string for `perms`.
#[must_use]
pub fn permissions_string(perms: InodePerms) -> String {
    let mut out = String::with_capacity(9);
    for bits in &CLASS_BITS {
        for (bit, letter) in bits.iter().zip(LETTERS) {
            out.push(if perms.contains(*bit) { letter } else { '-' });
        }
    }
    out
}

/// Render the access-control string passed to `set_access_control`, e.g.
/// `user::rwx,group::r-x,other::---`.
#[must_use]
pub fn mode_to_acl(perms: InodePerms) -> String {
    let rendered = permissions_string(perms);
    CLASS_NAMES
        .iter()
        .enumerate()
        .map(|(class, name)| format!("{name}::{}", &rendered[class * 3..class * 3 + 3]))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse an access-control string back into mode bits.
///
/// Named-user and named-group entries (`user:alice:r--`) and masks are ignored; `None` if one
/// of the three owning classes is missing.
#[must_use]
pub fn acl_to_perms(acl: &str) -> Option<InodePerms> {
    let mut found = [None::<&str>; 3];
    for entry in acl.split(',').map(str::trim) {
        let mut parts = entry.splitn(3, ':');
        let (Some(class), Some(qualifier), Some(bits)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if !qualifier.is_empty() || bits.len() != 3 {
            continue;
        }
        if let Some(idx) = CLASS_NAMES.iter().position(|name| *name == class) {
            found[idx] = Some(bits);
        }
    }
    let [Some(user), Some(group), Some(other)] = found else {
        return None;
    };
    Some(parse_permissions(&format!("{user}{group}{other}")))
}
