// Copyright (c) 2017-2021 Fabian Schuiki

//! Reading decoded instruction listings.
//!
//! A listing is a line-oriented textual form of the instruction records a
//! decoder produces. It is not an assembler: every line already states the
//! address, size, and control-transfer category of an instruction.
//!
//! ```text
//! ; comment
//! .entry main exported
//! main:  8000 2 other         ; LDA #5
//!        8002 2 branch skip   ; BEQ skip
//!        8004 3 jump ?        ; JMP ($0300)
//! skip:  8007 1 return        ; RTS
//! ```
//!
//! Addresses are hexadecimal with an optional `$`. A transfer target is an
//! address, a label, or `?` if it is unknown. A label may stand on a line of
//! its own, in which case it applies to the next instruction. Entry kinds are
//! `exported`, `interrupt-nmi`, `interrupt-reset`, `interrupt-irq`, `call`, and
//! `jumptable`.

use crate::program::{Address, EntryKind, EntryPoint, InstData, Opcode, Program};
use regex::Regex;
use std::{collections::HashMap, fmt};

/// A syntax error in a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingError {
    /// The 1-based line number.
    pub line: usize,
    pub message: String,
}

impl ListingError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for ListingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ListingError {}

fn regex(pattern: &str) -> Result<Regex, ListingError> {
    Regex::new(pattern).map_err(|e| ListingError::new(0, e.to_string()))
}

fn parse_address(text: &str) -> Option<Address> {
    let digits = text.strip_prefix('$').unwrap_or(text);
    Address::from_str_radix(digits, 16).ok()
}

struct PendingInst {
    line: usize,
    data: InstData,
    target: Option<String>,
}

/// Parse a listing into a program.
pub fn parse_listing(input: impl AsRef<str>) -> Result<Program, ListingError> {
    let entry_re = regex(r"^\.entry\s+(\S+)\s+(\S+)$")?;
    let inst_re = regex(
        r"^(?:([A-Za-z_.][\w.]*):)?\s*(?:\$?([0-9A-Fa-f]+)\s+(\d+)\s+([a-z]+)(?:\s+(\S+))?)?$",
    )?;

    let mut entries = vec![];
    let mut pending = vec![];
    let mut labels: HashMap<String, Address> = HashMap::new();
    let mut label = None;

    for (index, raw) in input.as_ref().lines().enumerate() {
        let line = index + 1;
        let (code, text) = match raw.find(';') {
            Some(pos) => (&raw[..pos], Some(raw[pos + 1..].trim())),
            None => (raw, None),
        };
        let code = code.trim();
        if code.is_empty() {
            continue;
        }

        let err = |message: String| ListingError::new(line, message);

        if let Some(caps) = entry_re.captures(code) {
            let kind = EntryKind::from_name(&caps[2])
                .ok_or_else(|| err(format!("unknown entry kind `{}`", &caps[2])))?;
            let what = &caps[1];
            entries.push(match what.strip_prefix('$') {
                Some(_) => match parse_address(what) {
                    Some(addr) => EntryPoint::at(addr, kind),
                    None => return Err(err(format!("invalid address `{}`", what))),
                },
                None => EntryPoint::named(what, kind),
            });
            continue;
        }

        let caps = inst_re
            .captures(code)
            .ok_or_else(|| err(format!("cannot parse `{}`", code)))?;
        if let Some(name) = caps.get(1) {
            if label.is_some() {
                return Err(ListingError::new(line, "two labels for one instruction"));
            }
            label = Some(name.as_str().to_string());
        }
        let address = match caps.get(2) {
            Some(addr) => addr.as_str(),
            None => continue,
        };
        let address = parse_address(address)
            .ok_or_else(|| err(format!("invalid address `{}`", address)))?;
        let size: u32 = caps[3]
            .parse()
            .map_err(|_| err(format!("invalid size `{}`", &caps[3])))?;
        let opcode = Opcode::from_name(&caps[4])
            .ok_or_else(|| err(format!("unknown category `{}`", &caps[4])))?;
        let target = caps.get(5).map(|m| m.as_str().to_string());
        if target.is_some() && !opcode.has_target() {
            return Err(err(format!("{} takes no target", opcode)));
        }

        let mut data = InstData::new(address, opcode, size);
        if let Some(name) = label.take() {
            if labels.insert(name.clone(), address).is_some() {
                return Err(err(format!("label `{}` defined twice", name)));
            }
            data = data.with_label(name);
        }
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            data = data.with_text(text);
        }
        pending.push(PendingInst { line, data, target });
    }
    if let Some(label) = label {
        return Err(ListingError::new(
            input.as_ref().lines().count(),
            format!("label `{}` is not followed by an instruction", label),
        ));
    }

    let mut insts = Vec::with_capacity(pending.len());
    for PendingInst { line, data, target } in pending {
        let err = |message: String| ListingError::new(line, message);
        let data = match target.as_ref().map(|t| t.as_str()) {
            None | Some("?") => data,
            Some(name) => match labels.get(name).cloned().or_else(|| parse_address(name)) {
                Some(addr) => data.with_target(addr),
                None => return Err(err(format!("unknown target `{}`", name))),
            },
        };
        insts.push(data);
    }
    debug!(
        "Read listing with {} instructions, {} entries",
        insts.len(),
        entries.len()
    );
    Ok(Program::new(insts, entries))
}
