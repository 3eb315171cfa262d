// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Utilities for reading the host's mount table.

use camino::{Utf8Path, Utf8PathBuf};

/// One line of a `/proc/self/mounts`-format mount table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: Utf8PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
}

/// Parses a mount table, skipping malformed lines.
pub fn parse_mount_table(data: &str) -> Vec<MountEntry> {
    data.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let device = parts.next()?;
            let mount_point = unescape_mount(parts.next()?);
            let fs_type = parts.next()?;
            let options = parts
                .next()
                .map(|opts| opts.split(',').map(str::to_string).collect())
                .unwrap_or_default();
            Some(MountEntry {
                device: device.to_string(),
                mount_point: mount_point.into(),
                fs_type: fs_type.to_string(),
                options,
            })
        })
        .collect()
}

/// Reads and parses the mount table at `path`.
pub async fn read_mount_table(
    path: &Utf8Path,
) -> Result<Vec<MountEntry>, std::io::Error> {
    let data = tokio::fs::read_to_string(path).await?;
    Ok(parse_mount_table(&data))
}

/// Returns true if anything is mounted at `target`.
pub fn is_mount_point(entries: &[MountEntry], target: &Utf8Path) -> bool {
    entries.iter().any(|entry| entry.mount_point == target)
}

// The kernel escapes space, tab, newline and backslash as three-digit octal.
fn unescape_mount(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            let mut octal = String::new();
            for _ in 0..3 {
                match chars.peek() {
                    Some(next) if next.is_digit(8) => {
                        octal.push(*next);
                        chars.next();
                    }
                    _ => break,
                }
            }
            if octal.len() == 3 {
                if let Ok(byte) = u8::from_str_radix(&octal, 8) {
                    output.push(char::from(byte));
                    continue;
                }
            }
            output.push(ch);
            output.push_str(&octal);
            continue;
        }
        output.push(ch);
    }
    output
}
