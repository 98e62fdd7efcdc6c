// SPDX-License-Identifier: Apache-2.0

//! Command dispatch table: an ordered list of matches invoked against each
//! incoming message.

use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::message::schema::SchemaLoader;
use crate::message::wire::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    False,
    True,
    Callback,
}

pub type MatchFn = Rc<dyn Fn(&Message) -> MatchOutcome>;
pub type CallbackFn = Box<dyn FnMut(&mut Message)>;

/// Exact command-name match, stops iteration on success.
pub fn exact(command: impl Into<String>) -> MatchFn {
    let command = command.into();
    Rc::new(move |msg: &Message| {
        if msg.command == command {
            MatchOutcome::True
        } else {
            MatchOutcome::False
        }
    })
}

/// Matches every message; typically used as a terminal catch-all.
pub fn always() -> MatchFn {
    Rc::new(|_msg: &Message| MatchOutcome::True)
}

/// Matches when `predicate` returns true, but (unlike [`exact`]/[`always`])
/// never stops iteration — later matches still get a chance.
pub fn callback(predicate: impl Fn(&Message) -> bool + 'static) -> MatchFn {
    Rc::new(move |msg: &Message| {
        if predicate(msg) {
            MatchOutcome::Callback
        } else {
            MatchOutcome::False
        }
    })
}

static NEXT_TAG: AtomicU32 = AtomicU32::new(1);

/// Allocates a process-wide monotonically increasing tag in `[1,
/// 2^32-1]`, wrapping back to `1` (never `0`, which means "no tag").
pub fn allocate_tag() -> u32 {
    loop {
        let current = NEXT_TAG.load(Ordering::Relaxed);
        let next = if current == u32::MAX { 1 } else { current + 1 };
        if NEXT_TAG
            .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return current;
        }
    }
}

struct DispatchEntry {
    #[allow(dead_code)]
    expression: String,
    matcher: MatchFn,
    callback: CallbackFn,
    tag: u32,
    priority: u8,
}

/// Ordered table of command-to-callback matches, with an optional
/// schema cache used to validate a message before its callback runs.
pub struct Dispatcher {
    entries: Vec<DispatchEntry>,
    schema: SchemaLoader,
    insertion_seq: u64,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            entries: Vec::new(),
            schema: SchemaLoader::default(),
            insertion_seq: 0,
        }
    }

    pub fn set_definition_path(&mut self, colon_separated_path: &str) {
        self.schema.set_search_path(colon_separated_path);
    }

    /// Adds a match; matches are kept stable-sorted by `priority` (`0..15`,
    /// lower runs first, ties broken by insertion order — the same
    /// convention as connection priority). Returns the allocated tag.
    pub fn add_match(
        &mut self,
        expression: impl Into<String>,
        matcher: MatchFn,
        callback: impl FnMut(&mut Message) + 'static,
        priority: u8,
    ) -> u32 {
        let tag = allocate_tag();
        self.insertion_seq += 1;
        self.entries.push(DispatchEntry {
            expression: expression.into(),
            matcher,
            callback: Box::new(callback),
            tag,
            priority,
        });
        self.entries.sort_by_key(|e| e.priority);
        tag
    }

    /// Adds the HELP match most services register by default.
    pub fn add_default_matches(&mut self) {
        self.add_match(
            "HELP",
            exact("HELP"),
            |msg: &mut Message| {
                msg.set("reply", "HELP_REPLY");
            },
            15,
        );
    }

    /// Removes every match carrying `tag` (bulk removal by tag).
    pub fn remove_by_tag(&mut self, tag: u32) -> usize {
        if tag == 0 {
            return 0;
        }
        let before = self.entries.len();
        self.entries.retain(|e| e.tag != tag);
        before - self.entries.len()
    }

    /// Iterates matches in priority order; on `TRUE`/`CALLBACK` the message
    /// is schema-checked (a schema rejection is logged and the message is
    /// dropped without running the callback), then the callback runs.
    /// `TRUE` stops iteration; `CALLBACK` continues. Returns whether any
    /// callback ran.
    pub fn dispatch(&mut self, message: &mut Message) -> bool {
        let mut dispatched = false;
        for entry in &mut self.entries {
            match (entry.matcher)(message) {
                MatchOutcome::False => continue,
                outcome @ (MatchOutcome::True | MatchOutcome::Callback) => {
                    match self.schema.load(&message.command) {
                        Ok(Some(def)) => {
                            if let Err(e) = def.validate(message) {
                                log::warn!(target: "eventdispatcher", "dropping message: {e}");
                                continue;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            log::warn!(target: "eventdispatcher", "failed to load schema for {:?}: {e}", message.command);
                        }
                    }
                    (entry.callback)(message);
                    message.processed = true;
                    dispatched = true;
                    if outcome == MatchOutcome::True {
                        return dispatched;
                    }
                }
            }
        }
        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn exact_match_stops_iteration() {
        let mut dispatcher = Dispatcher::new();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let c1 = calls.clone();
        dispatcher.add_match("PING", exact("PING"), move |_| c1.borrow_mut().push("first"), 0);
        let c2 = calls.clone();
        dispatcher.add_match("PING2", exact("PING"), move |_| c2.borrow_mut().push("second"), 1);

        let mut msg = Message::new("PING");
        assert!(dispatcher.dispatch(&mut msg));
        assert_eq!(*calls.borrow(), vec!["first"]);
    }

    #[test]
    fn callback_outcome_keeps_iterating() {
        let mut dispatcher = Dispatcher::new();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let c1 = calls.clone();
        dispatcher.add_match("LOG_ALL", callback(|_| true), move |_| c1.borrow_mut().push("logger"), 0);
        let c2 = calls.clone();
        dispatcher.add_match("PING", exact("PING"), move |_| c2.borrow_mut().push("handler"), 1);

        let mut msg = Message::new("PING");
        assert!(dispatcher.dispatch(&mut msg));
        assert_eq!(*calls.borrow(), vec!["logger", "handler"]);
    }

    #[test]
    fn unknown_command_falls_through_to_catch_all() {
        let mut dispatcher = Dispatcher::new();
        let replied = Rc::new(RefCell::new(false));
        let r = replied.clone();
        dispatcher.add_match("catch-all", always(), move |_| *r.borrow_mut() = true, 15);

        let mut msg = Message::new("WEIRD");
        assert!(dispatcher.dispatch(&mut msg));
        assert!(*replied.borrow());
    }

    #[test]
    fn tags_start_at_one_and_never_zero() {
        let mut dispatcher = Dispatcher::new();
        let tag = dispatcher.add_match("x", always(), |_| {}, 0);
        assert_ne!(tag, 0);
    }

    #[test]
    fn remove_by_tag_bulk_removes() {
        let mut dispatcher = Dispatcher::new();
        let t1 = dispatcher.add_match("a", exact("A"), |_| {}, 0);
        dispatcher.add_match("b", exact("B"), |_| {}, 0);
        assert_eq!(dispatcher.remove_by_tag(t1), 1);
        assert_eq!(dispatcher.entries.len(), 1);
    }
}
