//! Typed access to system variables through resolved handles.

use canoe_com_protocol::{ObjectHandle, Value};

use crate::error::{LinkError, RemoteError, Result};
use crate::remote::{namespace_segments, RemoteApplication};
use crate::session::Session;

/// A variable bound to one (namespace, name) pair within one connection.
///
/// Handles are plain data. After a reconnect they are stale and every access
/// through them fails until the variable is resolved again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableHandle {
    namespace: String,
    name: String,
    object: ObjectHandle,
    generation: u64,
}

impl VariableHandle {
    pub(crate) fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        object: ObjectHandle,
        generation: u64,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            object,
            generation,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// `Namespace::Name`, as CANoe writes it.
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.namespace, self.name)
    }
}

/// What [`Session::ensure_variable_with`] does when the variable already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnsurePolicy {
    /// Leave the current value untouched.
    #[default]
    KeepExisting,
    /// Overwrite the current value with the default.
    ResetToDefault,
}

impl Session {
    /// Read the live value behind `handle`. Nothing is cached.
    pub fn read_value(&mut self, handle: &VariableHandle) -> Result<Value> {
        let link = self.ensure_connected()?;
        let read_failure = |reason: String| LinkError::ReadFailure {
            variable: handle.qualified_name(),
            reason,
        };
        link.check_generation(handle.generation).map_err(read_failure)?;
        let result = link.app.get_value(handle.object);
        self.settle(result, |err| LinkError::from_remote(err, "read", read_failure))
    }

    /// Read a numeric variable.
    pub fn read(&mut self, handle: &VariableHandle) -> Result<f64> {
        let value = self.read_value(handle)?;
        value.as_f64().ok_or_else(|| LinkError::ReadFailure {
            variable: handle.qualified_name(),
            reason: format!("value is {} '{value}', not a number", value.kind()),
        })
    }

    /// Write through `handle`; the change is visible to CANoe immediately.
    pub fn write(&mut self, handle: &VariableHandle, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let link = self.ensure_connected()?;
        let write_failure = |reason: String| LinkError::WriteFailure {
            variable: handle.qualified_name(),
            reason,
        };
        link.check_generation(handle.generation)
            .map_err(write_failure)?;
        let result = link.app.set_value(handle.object, &value);
        self.settle(result, |err| LinkError::from_remote(err, "write", write_failure))
    }

    /// Resolve `name` across `candidates` and read it as a number.
    pub fn read_variable<S: AsRef<str>>(&mut self, name: &str, candidates: &[S]) -> Result<f64> {
        let handle = self.resolve(name, candidates)?.or_not_found(name)?;
        self.read(&handle)
    }

    /// Resolve `name` across `candidates` and write it.
    pub fn write_variable<S: AsRef<str>>(
        &mut self,
        name: &str,
        candidates: &[S],
        value: impl Into<Value>,
    ) -> Result<()> {
        let handle = self.resolve(name, candidates)?.or_not_found(name)?;
        self.write(&handle, value)
    }

    /// Create `namespace::name` if absent; an existing variable keeps its value.
    pub fn ensure_variable(
        &mut self,
        namespace: &str,
        name: &str,
        default: impl Into<Value>,
    ) -> Result<VariableHandle> {
        self.ensure_variable_with(namespace, name, default, EnsurePolicy::KeepExisting)
    }

    /// Create `namespace::name` if absent, with explicit handling of an existing variable.
    ///
    /// Missing namespaces along a nested path are created too.
    pub fn ensure_variable_with(
        &mut self,
        namespace: &str,
        name: &str,
        default: impl Into<Value>,
        policy: EnsurePolicy,
    ) -> Result<VariableHandle> {
        let default = default.into();
        let link = self.ensure_connected()?;
        let generation = link.info.generation;

        let create_failure = |reason: String| LinkError::CreateFailure {
            namespace: namespace.to_string(),
            name: name.to_string(),
            reason,
        };

        let segments: Vec<&str> = namespace_segments(namespace).collect();
        if segments.is_empty() {
            return Err(create_failure("namespace name is empty".into()));
        }
        if name.trim().is_empty() {
            return Err(create_failure("variable name is empty".into()));
        }

        let result = create_if_absent(link.app.as_mut(), &segments, name, &default, policy);
        let object = self.settle(result, |err| LinkError::from_remote(err, "create", create_failure))?;

        Ok(VariableHandle::new(
            segments.join("::"),
            name,
            object,
            generation,
        ))
    }
}

/// Find or create each namespace segment, then the variable inside the last one.
fn create_if_absent(
    app: &mut dyn RemoteApplication,
    segments: &[&str],
    name: &str,
    default: &Value,
    policy: EnsurePolicy,
) -> std::result::Result<ObjectHandle, RemoteError> {
    let mut current = None;
    for segment in segments {
        current = Some(match app.find_namespace(current, segment)? {
            Some(handle) => handle,
            None => {
                tracing::info!(namespace = segment, "creating namespace");
                app.add_namespace(current, segment)?
            }
        });
    }
    let namespace = current.ok_or_else(|| RemoteError::Remote("namespace name is empty".into()))?;

    match app.find_variable(namespace, name)? {
        Some(object) => {
            if policy == EnsurePolicy::ResetToDefault {
                app.set_value(object, default)?;
            }
            Ok(object)
        }
        None => {
            tracing::info!(namespace = %segments.join("::"), variable = name, default = %default, "creating variable");
            app.add_variable(namespace, name, default)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedApplication;

    fn connected(sim: &SimulatedApplication) -> Session {
        let mut session = Session::new(sim.connector());
        session.connect().unwrap();
        session
    }

    #[test]
    fn test_read_is_live() {
        let sim = SimulatedApplication::new();
        sim.add_variable("Measurement", "Temperature", 30.0);
        let mut session = connected(&sim);

        let handle = session
            .resolve("Temperature", &["Measurement"])
            .unwrap()
            .found()
            .unwrap();
        assert_eq!(session.read(&handle).unwrap(), 30.0);

        sim.set_value("Measurement", "Temperature", 31.5);
        assert_eq!(session.read(&handle).unwrap(), 31.5);
    }

    #[test]
    fn test_non_numeric_read_fails() {
        let sim = SimulatedApplication::new();
        sim.add_variable("General", "Mode", "idle");
        let mut session = connected(&sim);

        let err = session.read_variable("Mode", &["General"]).unwrap_err();
        assert!(matches!(err, LinkError::ReadFailure { .. }));
        assert!(err.to_string().contains("string 'idle'"));

        let handle = session.resolve("Mode", &["General"]).unwrap().found().unwrap();
        assert_eq!(session.read_value(&handle).unwrap(), Value::from("idle"));
    }

    #[test]
    fn test_unavailable_value_is_read_failure() {
        let sim = SimulatedApplication::new();
        sim.add_unreadable_variable("Diag", "Secret", "access denied");
        let mut session = connected(&sim);

        let err = session.read_variable("Secret", &["Diag"]).unwrap_err();
        assert!(
            matches!(err, LinkError::ReadFailure { ref reason, .. } if reason == "access denied")
        );
    }

    #[test]
    fn test_write_is_visible_immediately() {
        let sim = SimulatedApplication::new();
        sim.add_variable("General", "Setpoint", 1.0);
        let mut session = connected(&sim);

        session.write_variable("Setpoint", &["General"], 4.0).unwrap();
        assert_eq!(sim.value_of("General", "Setpoint"), Some(Value::Number(4.0)));
    }

    #[test]
    fn test_write_type_mismatch() {
        let sim = SimulatedApplication::new();
        sim.add_variable("General", "Setpoint", 1.0);
        let mut session = connected(&sim);

        let err = session
            .write_variable("Setpoint", &["General"], "fast")
            .unwrap_err();
        assert!(matches!(err, LinkError::WriteFailure { .. }));
        assert_eq!(sim.value_of("General", "Setpoint"), Some(Value::Number(1.0)));
    }

    #[test]
    fn test_stale_handle_after_reconnect() {
        let sim = SimulatedApplication::new();
        sim.add_variable("General", "Setpoint", 1.0);
        let mut session = connected(&sim);

        let handle = session.resolve("Setpoint", &["General"]).unwrap().found().unwrap();
        session.disconnect();
        session.connect().unwrap();

        let err = session.read(&handle).unwrap_err();
        assert!(matches!(err, LinkError::ReadFailure { ref reason, .. } if reason.contains("stale")));
        let err = session.write(&handle, 2.0).unwrap_err();
        assert!(matches!(err, LinkError::WriteFailure { .. }));

        let fresh = session.resolve("Setpoint", &["General"]).unwrap().found().unwrap();
        assert_eq!(fresh.generation(), 2);
        assert_eq!(session.read(&fresh).unwrap(), 1.0);
    }

    #[test]
    fn test_ensure_creates_namespace_and_variable() {
        let sim = SimulatedApplication::new();
        let mut session = connected(&sim);

        let handle = session.ensure_variable("Bench", "Counter", 0.0).unwrap();
        assert_eq!(handle.qualified_name(), "Bench::Counter");
        assert_eq!(session.read(&handle).unwrap(), 0.0);
        assert_eq!(sim.value_of("Bench", "Counter"), Some(Value::Number(0.0)));
    }

    #[test]
    fn test_ensure_keeps_existing_value() {
        let sim = SimulatedApplication::new();
        let mut session = connected(&sim);

        let first = session.ensure_variable("Bench", "Counter", 1.0).unwrap();
        session.write(&first, 7.0).unwrap();
        let second = session.ensure_variable("Bench", "Counter", 2.0).unwrap();

        assert_eq!(first, second);
        assert_eq!(session.read(&second).unwrap(), 7.0);
    }

    #[test]
    fn test_ensure_reset_policy_overwrites() {
        let sim = SimulatedApplication::new();
        sim.add_variable("Bench", "Counter", 7.0);
        let mut session = connected(&sim);

        let handle = session
            .ensure_variable_with("Bench", "Counter", 0.0, EnsurePolicy::ResetToDefault)
            .unwrap();
        assert_eq!(session.read(&handle).unwrap(), 0.0);
    }

    #[test]
    fn test_ensure_nested_namespace() {
        let sim = SimulatedApplication::new();
        sim.add_namespace("Vehicle");
        let mut session = connected(&sim);

        let handle = session
            .ensure_variable("Vehicle :: Body", "DoorOpen", false)
            .unwrap();
        assert_eq!(handle.namespace(), "Vehicle::Body");
        assert_eq!(sim.value_of("Vehicle::Body", "DoorOpen"), Some(Value::Bool(false)));
    }

    #[test]
    fn test_ensure_rejects_empty_names() {
        let sim = SimulatedApplication::new();
        let mut session = connected(&sim);

        assert!(matches!(
            session.ensure_variable("", "X", 0.0),
            Err(LinkError::CreateFailure { .. })
        ));
        assert!(matches!(
            session.ensure_variable("Bench", " ", 0.0),
            Err(LinkError::CreateFailure { .. })
        ));
    }

    #[test]
    fn test_ensure_remote_failure_is_create_failure() {
        let sim = SimulatedApplication::new();
        sim.reject_creates("configuration is read-only");
        let mut session = connected(&sim);

        let err = session.ensure_variable("Bench", "Counter", 0.0).unwrap_err();
        assert!(
            matches!(err, LinkError::CreateFailure { ref reason, .. } if reason.contains("read-only"))
        );
    }

    #[test]
    fn test_lost_link_read_disconnects() {
        let sim = SimulatedApplication::new();
        sim.add_variable("Measurement", "Temperature", 30.0);
        let mut session = connected(&sim);
        let handle = session
            .resolve("Temperature", &["Measurement"])
            .unwrap()
            .found()
            .unwrap();

        sim.break_link();
        assert!(matches!(session.read(&handle), Err(LinkError::NotConnected)));
        assert!(!session.is_connected());

        // Reconnected, but the old handle belongs to the dead link
        let err = session.read(&handle).unwrap_err();
        assert!(err.to_string().contains("stale handle"));
        assert_eq!(session.read_variable("Temperature", &["Measurement"]).unwrap(), 30.0);
    }

    #[test]
    fn test_lost_link_during_ensure_disconnects() {
        let sim = SimulatedApplication::new();
        let mut session = connected(&sim);

        sim.break_link();
        assert!(matches!(
            session.ensure_variable("Bench", "Counter", 0.0),
            Err(LinkError::NotConnected)
        ));
        assert!(!session.is_connected());
    }
}
