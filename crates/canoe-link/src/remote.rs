//! The seam between the session core and whatever holds the live
//! `CANoe.Application` object graph.
//!
//! A backend exposes the graph through opaque [`ObjectHandle`]s. Lookups that
//! miss return `Ok(None)`; `Err` is reserved for the application raising an
//! exception or the link itself failing.

use canoe_com_protocol::{AppIdentity, Entry, ObjectHandle, Value};

use crate::error::RemoteError;

/// A live link to the application root object.
///
/// `parent: None` addresses the root namespace collection.
pub trait RemoteApplication {
    fn identity(&mut self) -> Result<AppIdentity, RemoteError>;

    fn namespaces(&mut self, parent: Option<ObjectHandle>) -> Result<Vec<Entry>, RemoteError>;

    fn find_namespace(
        &mut self,
        parent: Option<ObjectHandle>,
        name: &str,
    ) -> Result<Option<ObjectHandle>, RemoteError>;

    fn add_namespace(
        &mut self,
        parent: Option<ObjectHandle>,
        name: &str,
    ) -> Result<ObjectHandle, RemoteError>;

    fn variables(&mut self, namespace: ObjectHandle) -> Result<Vec<Entry>, RemoteError>;

    fn find_variable(
        &mut self,
        namespace: ObjectHandle,
        name: &str,
    ) -> Result<Option<ObjectHandle>, RemoteError>;

    fn add_variable(
        &mut self,
        namespace: ObjectHandle,
        name: &str,
        initial: &Value,
    ) -> Result<ObjectHandle, RemoteError>;

    fn get_value(&mut self, variable: ObjectHandle) -> Result<Value, RemoteError>;

    fn set_value(&mut self, variable: ObjectHandle, value: &Value) -> Result<(), RemoteError>;

    fn find_procedure(&mut self, name: &str) -> Result<Option<ObjectHandle>, RemoteError>;

    fn call_procedure(
        &mut self,
        procedure: ObjectHandle,
        args: &[Value],
    ) -> Result<Value, RemoteError>;

    fn measurement_running(&mut self) -> Result<bool, RemoteError>;

    fn start_measurement(&mut self) -> Result<(), RemoteError>;

    fn stop_measurement(&mut self) -> Result<(), RemoteError>;

    /// Drop every remote reference held by this link.
    fn release(&mut self) -> Result<(), RemoteError>;
}

/// Opens fresh links to the application.
pub trait Connector {
    fn open(&mut self) -> Result<Box<dyn RemoteApplication>, RemoteError>;
}

impl<F> Connector for F
where
    F: FnMut() -> Result<Box<dyn RemoteApplication>, RemoteError>,
{
    fn open(&mut self) -> Result<Box<dyn RemoteApplication>, RemoteError> {
        self()
    }
}

/// Split a namespace path such as `Vehicle::Powertrain` into its segments.
pub fn namespace_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split("::").map(str::trim).filter(|s| !s.is_empty())
}

/// Walk a namespace path segment by segment from the root.
///
/// Returns `Ok(None)` as soon as one segment is missing, and for an empty path.
pub fn find_namespace_path(
    app: &mut dyn RemoteApplication,
    path: &str,
) -> Result<Option<ObjectHandle>, RemoteError> {
    let mut current = None;
    for segment in namespace_segments(path) {
        match app.find_namespace(current, segment)? {
            Some(handle) => current = Some(handle),
            None => return Ok(None),
        }
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_segments() {
        let segments: Vec<&str> = namespace_segments("Vehicle:: Powertrain::").collect();
        assert_eq!(segments, vec!["Vehicle", "Powertrain"]);
        assert_eq!(namespace_segments("").count(), 0);
        assert_eq!(namespace_segments("General").collect::<Vec<_>>(), vec!["General"]);
    }
}
