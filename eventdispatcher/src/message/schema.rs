// SPDX-License-Identifier: Apache-2.0

//! Message definitions ("schema"): per-command parameter typing and
//! presence rules loaded from `<command>.conf` files.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::message::wire::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Address,
    Timespec,
}

impl ParamType {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "string" => Ok(ParamType::String),
            "integer" => Ok(ParamType::Integer),
            "address" => Ok(ParamType::Address),
            "timespec" => Ok(ParamType::Timespec),
            other => Err(Error::init(format!("unknown parameter type {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamFlag {
    Required,
    Empty,
    Forbidden,
    Optional,
    Defined,
    Allowed,
}

impl ParamFlag {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "required" => Ok(ParamFlag::Required),
            "empty" => Ok(ParamFlag::Empty),
            "forbidden" => Ok(ParamFlag::Forbidden),
            "optional" => Ok(ParamFlag::Optional),
            "defined" => Ok(ParamFlag::Defined),
            "allowed" => Ok(ParamFlag::Allowed),
            other => Err(Error::init(format!("unknown parameter flag {other:?}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParamDef {
    pub ty: ParamType,
    pub flags: HashSet<ParamFlag>,
}

impl ParamDef {
    fn is_required(&self) -> bool {
        self.flags.contains(&ParamFlag::Required) || self.flags.contains(&ParamFlag::Defined)
    }

    fn is_forbidden(&self) -> bool {
        self.flags.contains(&ParamFlag::Forbidden)
    }

    fn allows_empty(&self) -> bool {
        self.flags.contains(&ParamFlag::Empty)
    }
}

#[derive(Debug, Clone)]
pub struct MessageDefinition {
    pub command: String,
    pub parameters: HashMap<String, ParamDef>,
}

impl MessageDefinition {
    /// A message is valid iff every required parameter is present and
    /// non-forbidden, and every present parameter matches its declared
    /// type.
    pub fn validate(&self, message: &Message) -> Result<()> {
        for (name, def) in &self.parameters {
            let present = message.has(name);
            if def.is_required() && !present {
                return Err(Error::protocol(format!(
                    "{}: required parameter {name:?} is missing",
                    self.command
                )));
            }
            if present && def.is_forbidden() {
                return Err(Error::protocol(format!(
                    "{}: parameter {name:?} is forbidden",
                    self.command
                )));
            }
            if present {
                let value = message.get_string(name).unwrap();
                if value.is_empty() && !def.allows_empty() {
                    return Err(Error::protocol(format!(
                        "{}: parameter {name:?} cannot be empty",
                        self.command
                    )));
                }
                if !value.is_empty() {
                    check_type(&self.command, name, value, def.ty)?;
                }
            }
        }
        Ok(())
    }
}

fn check_type(command: &str, name: &str, value: &str, ty: ParamType) -> Result<()> {
    match ty {
        ParamType::String => Ok(()),
        ParamType::Integer | ParamType::Timespec => value
            .parse::<i64>()
            .map(|_| ())
            .map_err(|_| Error::protocol(format!("{command}: parameter {name:?} is not an integer"))),
        ParamType::Address => {
            if value.is_empty() {
                Err(Error::protocol(format!(
                    "{command}: parameter {name:?} is not a valid address"
                )))
            } else {
                Ok(())
            }
        }
    }
}

fn canonical_section_name(section: &str) -> String {
    section.replace('-', "_")
}

fn parse_conf(command: &str, contents: &str) -> Result<MessageDefinition> {
    let mut parameters = HashMap::new();
    let mut current_section: Option<String> = None;
    let mut current_type: Option<ParamType> = None;
    let mut current_flags: HashSet<ParamFlag> = HashSet::new();

    let flush = |section: &Option<String>,
                 ty: &Option<ParamType>,
                 flags: &HashSet<ParamFlag>,
                 parameters: &mut HashMap<String, ParamDef>|
     -> Result<()> {
        if let Some(section) = section {
            let ty = ty.ok_or_else(|| {
                Error::init(format!("section [{section}] is missing a 'type' entry"))
            })?;
            parameters.insert(
                section.clone(),
                ParamDef {
                    ty,
                    flags: flags.clone(),
                },
            );
        }
        Ok(())
    };

    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            flush(&current_section, &current_type, &current_flags, &mut parameters)?;
            current_section = Some(canonical_section_name(section.trim()));
            current_type = None;
            current_flags = HashSet::new();
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| Error::init(format!("malformed line in {command}.conf: {raw_line:?}")))?;
        let key = key.trim();
        let value = value.trim();
        match key {
            "type" => current_type = Some(ParamType::parse(value)?),
            "flags" => {
                for flag in value.split(',') {
                    let flag = flag.trim();
                    if flag.is_empty() {
                        continue;
                    }
                    current_flags.insert(ParamFlag::parse(flag)?);
                }
            }
            other => {
                return Err(Error::init(format!(
                    "unknown key {other:?} in {command}.conf"
                )))
            }
        }
    }
    flush(&current_section, &current_type, &current_flags, &mut parameters)?;

    Ok(MessageDefinition {
        command: command.to_string(),
        parameters,
    })
}

/// Loads and caches message definitions from a colon-separated directory
/// search path. Resolution is lazy: the first directory on the
/// path containing `<command>.conf` wins, and the result (including a
/// miss) is cached for the lifetime of the loader.
pub struct SchemaLoader {
    search_path: Vec<PathBuf>,
    cache: RefCell<HashMap<String, Option<Rc<MessageDefinition>>>>,
}

const DEFAULT_SEARCH_PATH: &str = "/usr/share/eventdispatcher/messages";
const SEARCH_PATH_ENV: &str = "EVENTDISPATCHER_MESSAGE_DEFINITIONS_PATH";

impl Default for SchemaLoader {
    fn default() -> Self {
        let raw = std::env::var(SEARCH_PATH_ENV).unwrap_or_else(|_| DEFAULT_SEARCH_PATH.to_string());
        Self::new(&raw)
    }
}

impl SchemaLoader {
    pub fn new(colon_separated_path: &str) -> Self {
        SchemaLoader {
            search_path: colon_separated_path.split(':').map(PathBuf::from).collect(),
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn set_search_path(&mut self, colon_separated_path: &str) {
        self.search_path = colon_separated_path.split(':').map(PathBuf::from).collect();
        self.cache.borrow_mut().clear();
    }

    /// Returns `None` if no `.conf` file exists for `command` anywhere on
    /// the search path (unscripted commands are simply not schema-checked).
    pub fn load(&self, command: &str) -> Result<Option<Rc<MessageDefinition>>> {
        if let Some(hit) = self.cache.borrow().get(command) {
            return Ok(hit.clone());
        }
        for dir in &self.search_path {
            let candidate = dir.join(format!("{command}.conf"));
            if let Ok(contents) = fs::read_to_string(&candidate) {
                let def = Rc::new(parse_conf(command, &contents)?);
                self.cache
                    .borrow_mut()
                    .insert(command.to_string(), Some(def.clone()));
                return Ok(Some(def));
            }
        }
        self.cache.borrow_mut().insert(command.to_string(), None);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_conf(dir: &std::path::Path, command: &str, body: &str) {
        let mut f = fs::File::create(dir.join(format!("{command}.conf"))).unwrap();
        f.write_all(body.as_bytes()).unwrap();
    }

    #[test]
    fn login_requires_user_and_forbids_password() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(
            dir.path(),
            "LOGIN",
            "[user]\ntype = string\nflags = required\n\n[password]\ntype = string\nflags = forbidden\n",
        );
        let loader = SchemaLoader::new(dir.path().to_str().unwrap());
        let def = loader.load("LOGIN").unwrap().unwrap();

        let ok = crate::message::wire::parse("LOGIN user=bob\n").unwrap();
        assert!(def.validate(&ok).is_ok());

        let bad = crate::message::wire::parse("LOGIN password=x\n").unwrap();
        assert!(def.validate(&bad).is_err());
    }

    #[test]
    fn unknown_command_has_no_schema() {
        let dir = tempfile::tempdir().unwrap();
        let loader = SchemaLoader::new(dir.path().to_str().unwrap());
        assert!(loader.load("NOPE").unwrap().is_none());
    }

    #[test]
    fn dash_in_section_name_is_canonicalized() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(dir.path(), "PING", "[user-name]\ntype = string\nflags = required\n");
        let loader = SchemaLoader::new(dir.path().to_str().unwrap());
        let def = loader.load("PING").unwrap().unwrap();
        assert!(def.parameters.contains_key("user_name"));
    }

    #[test]
    fn integer_type_checked() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(dir.path(), "COUNT", "[n]\ntype = integer\nflags = required\n");
        let loader = SchemaLoader::new(dir.path().to_str().unwrap());
        let def = loader.load("COUNT").unwrap().unwrap();
        let good = crate::message::wire::parse("COUNT n=42\n").unwrap();
        assert!(def.validate(&good).is_ok());
        let bad = crate::message::wire::parse("COUNT n=abc\n").unwrap();
        assert!(def.validate(&bad).is_err());
    }
}
