//! Numeric handles for the COM objects handed to the client.

use std::collections::HashMap;

use canoe_com_protocol::ObjectHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Namespace,
    Variable,
    Function,
}

type NameKey = (Kind, Option<ObjectHandle>, String);

/// Every object is keyed by (kind, parent, name). Finding the same name again
/// returns the handle it already has, so polling lookups do not grow the table.
pub struct HandleTable<T> {
    objects: HashMap<ObjectHandle, (Kind, T)>,
    named: HashMap<NameKey, ObjectHandle>,
    next_handle: ObjectHandle,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            named: HashMap::new(),
            next_handle: 1,
        }
    }

    /// The handle for `name` under `parent`. An existing handle is kept and
    /// now refers to `object`.
    pub fn intern(
        &mut self,
        kind: Kind,
        parent: Option<ObjectHandle>,
        name: &str,
        object: T,
    ) -> ObjectHandle {
        let key = (kind, parent, name.to_string());
        let handle = match self.named.get(&key) {
            Some(&handle) => handle,
            None => {
                let handle = self.next_handle;
                self.next_handle += 1;
                self.named.insert(key, handle);
                handle
            }
        };
        self.objects.insert(handle, (kind, object));
        handle
    }

    /// `name` no longer exists under `parent`.
    pub fn forget(&mut self, kind: Kind, parent: Option<ObjectHandle>, name: &str) {
        if let Some(handle) = self.named.remove(&(kind, parent, name.to_string())) {
            self.objects.remove(&handle);
        }
    }

    pub fn get(&self, handle: ObjectHandle, want: Kind) -> Result<&T, String> {
        match self.objects.get(&handle) {
            Some((kind, object)) if *kind == want => Ok(object),
            Some(_) => Err(format!("handle {handle} refers to a different kind of object")),
            None => Err(format!("unknown handle {handle}")),
        }
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.objects.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_lookup_reuses_handle() {
        let mut table = HandleTable::new();
        let ns = table.intern(Kind::Namespace, None, "Measurement", "ns#1");
        let first = table.intern(Kind::Variable, Some(ns), "Temperature", "var#1");

        for i in 0..100 {
            let again = table.intern(Kind::Variable, Some(ns), "Temperature", "var#n");
            assert_eq!(again, first, "lookup {i}");
        }
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(first, Kind::Variable), Ok(&"var#n"));
    }

    #[test]
    fn test_same_name_different_parent_or_kind() {
        let mut table = HandleTable::new();
        let a = table.intern(Kind::Namespace, None, "A", ());
        let b = table.intern(Kind::Namespace, None, "B", ());
        let in_a = table.intern(Kind::Variable, Some(a), "X", ());
        let in_b = table.intern(Kind::Variable, Some(b), "X", ());
        let ns_x = table.intern(Kind::Namespace, Some(a), "X", ());

        assert_ne!(in_a, in_b);
        assert_ne!(in_a, ns_x);
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn test_kind_is_checked() {
        let mut table = HandleTable::new();
        let function = table.intern(Kind::Function, None, "ResetAll", ());

        assert!(table.get(function, Kind::Function).is_ok());
        assert!(table
            .get(function, Kind::Variable)
            .unwrap_err()
            .contains("different kind"));
        assert!(table.get(99, Kind::Function).unwrap_err().contains("unknown handle"));
    }

    #[test]
    fn test_forget_drops_handle() {
        let mut table = HandleTable::new();
        let handle = table.intern(Kind::Function, None, "ResetAll", ());
        table.forget(Kind::Function, None, "ResetAll");

        assert_eq!(table.len(), 0);
        assert!(table.get(handle, Kind::Function).is_err());

        // Found again later: a fresh handle
        let again = table.intern(Kind::Function, None, "ResetAll", ());
        assert_ne!(again, handle);
    }
}
