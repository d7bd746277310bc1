//! Flat listing of every namespace and variable, for operators debugging a
//! configuration where a variable "should be there" but does not resolve.

use std::collections::VecDeque;

use canoe_com_protocol::{Entry, ObjectHandle, Value};

use crate::error::{LinkError, RemoteError, Result};
use crate::remote::RemoteApplication;
use crate::session::Session;

/// A variable's value in a listing, or why it could not be read.
#[derive(Debug, Clone, PartialEq)]
pub enum ListedValue {
    Value(Value),
    Unreadable(String),
}

impl std::fmt::Display for ListedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListedValue::Value(value) => write!(f, "{value}"),
            ListedValue::Unreadable(reason) => write!(f, "#ERROR: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableListing {
    /// Full namespace path, nested levels joined with `::`.
    pub namespace: String,
    pub name: String,
    pub value: ListedValue,
}

/// Lazy depth-first walk over the namespace tree.
///
/// Failures below the root are reported inline. A lost link is reported once
/// and ends the walk.
pub struct VariableWalk<'s> {
    session: &'s mut Session,
    pending: Vec<(String, ObjectHandle)>,
    namespace: String,
    variables: std::vec::IntoIter<Entry>,
    inline: VecDeque<VariableListing>,
    visited: usize,
    stopped: bool,
}

impl<'s> VariableWalk<'s> {
    fn new(session: &'s mut Session, roots: Vec<Entry>) -> Self {
        let pending = roots
            .into_iter()
            .rev()
            .map(|entry| (entry.name, entry.handle))
            .collect();
        Self {
            session,
            pending,
            namespace: String::new(),
            variables: Vec::new().into_iter(),
            inline: VecDeque::new(),
            visited: 0,
            stopped: false,
        }
    }

    /// Namespaces entered so far.
    pub fn namespaces_visited(&self) -> usize {
        self.visited
    }

    fn call<T>(
        &mut self,
        op: impl FnOnce(&mut (dyn RemoteApplication + 'static)) -> std::result::Result<T, RemoteError>,
    ) -> std::result::Result<T, RemoteError> {
        let result = match self.session.remote_app() {
            Some(app) => op(app),
            None => Err(RemoteError::Transport("link closed".into())),
        };
        if let Err(err) = &result {
            if err.is_link_lost() {
                self.session.lose_link(err);
                self.stopped = true;
                self.pending.clear();
                self.variables = Vec::new().into_iter();
            }
        }
        result
    }

    fn enter(&mut self, path: String, handle: ObjectHandle) {
        self.visited += 1;

        match self.call(|app| app.namespaces(Some(handle))) {
            Ok(children) => {
                for child in children.into_iter().rev() {
                    self.pending
                        .push((format!("{path}::{}", child.name), child.handle));
                }
            }
            Err(err) => {
                tracing::warn!(namespace = %path, "cannot list nested namespaces: {err}");
                self.inline.push_back(unreadable(&path, format!("nested namespaces unavailable: {err}")));
            }
        }

        if !self.stopped {
            match self.call(|app| app.variables(handle)) {
                Ok(variables) => self.variables = variables.into_iter(),
                Err(err) => {
                    tracing::warn!(namespace = %path, "cannot list variables: {err}");
                    self.variables = Vec::new().into_iter();
                    self.inline.push_back(unreadable(&path, format!("variables unavailable: {err}")));
                }
            }
        }

        self.namespace = path;
    }
}

fn unreadable(namespace: &str, reason: String) -> VariableListing {
    VariableListing {
        namespace: namespace.to_string(),
        name: "*".to_string(),
        value: ListedValue::Unreadable(reason),
    }
}

impl Iterator for VariableWalk<'_> {
    type Item = VariableListing;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(listing) = self.inline.pop_front() {
                return Some(listing);
            }

            if let Some(entry) = self.variables.next() {
                let value = match self.call(|app| app.get_value(entry.handle)) {
                    Ok(value) => ListedValue::Value(value),
                    Err(err) => {
                        tracing::warn!(namespace = %self.namespace, variable = %entry.name, "read failed: {err}");
                        ListedValue::Unreadable(err.to_string())
                    }
                };
                return Some(VariableListing {
                    namespace: self.namespace.clone(),
                    name: entry.name,
                    value,
                });
            }

            let (path, handle) = self.pending.pop()?;
            self.enter(path, handle);
        }
    }
}

/// A completed walk.
#[derive(Debug, Clone, PartialEq)]
pub struct Inventory {
    pub entries: Vec<VariableListing>,
    pub namespaces_visited: usize,
}

impl Inventory {
    /// The walk succeeded and found nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn unreadable(&self) -> impl Iterator<Item = &VariableListing> {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.value, ListedValue::Unreadable(_)))
    }
}

impl Session {
    /// Start a fresh walk over every namespace and variable.
    ///
    /// Fails only if the root namespace collection itself is inaccessible; an
    /// empty configuration yields an empty walk.
    pub fn list_all_variables(&mut self) -> Result<VariableWalk<'_>> {
        let link = self.ensure_connected()?;
        let roots = link.app.namespaces(None);
        let roots = self.settle(roots, |err| {
            LinkError::from_remote(err, "enumeration", LinkError::EnumerationFailed)
        })?;
        Ok(VariableWalk::new(self, roots))
    }

    /// Run a complete walk and collect it.
    pub fn inventory(&mut self) -> Result<Inventory> {
        let mut walk = self.list_all_variables()?;
        let entries: Vec<VariableListing> = walk.by_ref().collect();
        Ok(Inventory {
            entries,
            namespaces_visited: walk.namespaces_visited(),
        })
    }
}
