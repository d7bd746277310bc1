//! In-memory stand-in for a CANoe instance.
//!
//! Used by the test suite and by `canoe-link --simulate` for dry runs. Every
//! call a session makes is recorded, and individual failure modes can be
//! switched on to exercise error paths.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;

use canoe_com_protocol::{AppIdentity, Entry, ObjectHandle, Value};
use serde::{Deserialize, Serialize};

use crate::error::{LinkError, RemoteError};
use crate::remote::{namespace_segments, Connector, RemoteApplication};

/// Serializable description of a simulated configuration.
///
/// ```json
/// {
///   "namespaces": {
///     "Measurement": { "variables": { "Temperature": 30.0 } },
///     "Vehicle": { "namespaces": { "Body": { "variables": { "DoorOpen": false } } } }
///   },
///   "procedures": { "ResetAll": null }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedGraph {
    pub application: Option<AppIdentity>,
    pub namespaces: BTreeMap<String, NamespaceSpec>,
    /// CAPL functions and the value each returns.
    pub procedures: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceSpec {
    pub variables: BTreeMap<String, Value>,
    pub namespaces: BTreeMap<String, NamespaceSpec>,
}

#[derive(Debug)]
enum Node {
    Namespace {
        name: String,
        parent: Option<usize>,
        children: Vec<usize>,
        variables: Vec<usize>,
    },
    Variable {
        name: String,
        namespace: usize,
        value: Result<Value, String>,
    },
    Procedure {
        name: String,
        outcome: Result<Value, String>,
        calls: usize,
        last_args: Option<Vec<Value>>,
    },
}

#[derive(Debug)]
struct State {
    identity: AppIdentity,
    nodes: Vec<Node>,
    roots: Vec<usize>,
    procedures: Vec<usize>,
    measurement_running: bool,
    calls: Vec<String>,
    opens: usize,
    released: bool,
    connect_failure: Option<String>,
    identity_failure: Option<String>,
    root_failure: Option<String>,
    rejected_namespaces: Vec<String>,
    create_failure: Option<String>,
}

impl State {
    fn new() -> Self {
        Self {
            identity: AppIdentity {
                name: "CANoe".to_string(),
                version: "simulated".to_string(),
            },
            nodes: Vec::new(),
            roots: Vec::new(),
            procedures: Vec::new(),
            measurement_running: false,
            calls: Vec::new(),
            opens: 0,
            released: true,
            connect_failure: None,
            identity_failure: None,
            root_failure: None,
            rejected_namespaces: Vec::new(),
            create_failure: None,
        }
    }

    fn record(&mut self, call: String) -> Result<(), RemoteError> {
        self.calls.push(call);
        if self.released {
            return Err(RemoteError::Transport("link released".into()));
        }
        Ok(())
    }

    fn index(&self, handle: ObjectHandle) -> Result<usize, RemoteError> {
        let index = handle
            .checked_sub(1)
            .and_then(|i| usize::try_from(i).ok())
            .filter(|&i| i < self.nodes.len());
        index.ok_or_else(|| RemoteError::Remote(format!("invalid object handle {handle}")))
    }

    fn namespace_index(&self, handle: ObjectHandle) -> Result<usize, RemoteError> {
        let index = self.index(handle)?;
        match self.nodes[index] {
            Node::Namespace { .. } => Ok(index),
            _ => Err(RemoteError::Remote(format!("object {handle} is not a namespace"))),
        }
    }

    fn name(&self, index: usize) -> &str {
        match &self.nodes[index] {
            Node::Namespace { name, .. }
            | Node::Variable { name, .. }
            | Node::Procedure { name, .. } => name,
        }
    }

    fn path(&self, index: usize) -> String {
        match &self.nodes[index] {
            Node::Namespace {
                name,
                parent: Some(parent),
                ..
            } => format!("{}::{name}", self.path(*parent)),
            Node::Namespace { name, .. } => name.clone(),
            Node::Variable {
                name, namespace, ..
            } => format!("{}::{name}", self.path(*namespace)),
            Node::Procedure { name, .. } => name.clone(),
        }
    }

    fn parent_label(&self, parent: Option<usize>) -> String {
        parent.map(|p| self.path(p)).unwrap_or_else(|| "<root>".into())
    }

    fn children(&self, parent: Option<usize>) -> &[usize] {
        match parent {
            None => &self.roots,
            Some(index) => match &self.nodes[index] {
                Node::Namespace { children, .. } => children,
                _ => &[],
            },
        }
    }

    fn variables_of(&self, namespace: usize) -> &[usize] {
        match &self.nodes[namespace] {
            Node::Namespace { variables, .. } => variables,
            _ => &[],
        }
    }

    fn child_namespace(&self, parent: Option<usize>, name: &str) -> Option<usize> {
        self.children(parent)
            .iter()
            .copied()
            .find(|&i| self.name(i) == name)
    }

    fn variable_in(&self, namespace: usize, name: &str) -> Option<usize> {
        self.variables_of(namespace)
            .iter()
            .copied()
            .find(|&i| self.name(i) == name)
    }

    fn procedure(&self, name: &str) -> Option<usize> {
        self.procedures
            .iter()
            .copied()
            .find(|&i| self.name(i) == name)
    }

    fn lookup_path(&self, path: &str) -> Option<usize> {
        let mut current = None;
        for segment in namespace_segments(path) {
            current = Some(self.child_namespace(current, segment)?);
        }
        current
    }

    fn push_namespace(&mut self, parent: Option<usize>, name: &str) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Node::Namespace {
            name: name.to_string(),
            parent,
            children: Vec::new(),
            variables: Vec::new(),
        });
        match parent {
            None => self.roots.push(index),
            Some(p) => {
                if let Node::Namespace { children, .. } = &mut self.nodes[p] {
                    children.push(index);
                }
            }
        }
        index
    }

    fn ensure_path(&mut self, path: &str) -> Option<usize> {
        let mut current = None;
        for segment in namespace_segments(path) {
            let next = match self.child_namespace(current, segment) {
                Some(index) => index,
                None => self.push_namespace(current, segment),
            };
            current = Some(next);
        }
        current
    }

    fn push_variable(&mut self, namespace: usize, name: &str, value: Result<Value, String>) -> usize {
        if let Some(existing) = self.variable_in(namespace, name) {
            if let Node::Variable { value: slot, .. } = &mut self.nodes[existing] {
                *slot = value;
            }
            return existing;
        }
        let index = self.nodes.len();
        self.nodes.push(Node::Variable {
            name: name.to_string(),
            namespace,
            value,
        });
        if let Node::Namespace { variables, .. } = &mut self.nodes[namespace] {
            variables.push(index);
        }
        index
    }

    fn push_procedure(&mut self, name: &str, outcome: Result<Value, String>) {
        let index = self.nodes.len();
        self.nodes.push(Node::Procedure {
            name: name.to_string(),
            outcome,
            calls: 0,
            last_args: None,
        });
        self.procedures.push(index);
    }

    fn entries(&self, indices: &[usize]) -> Vec<Entry> {
        indices
            .iter()
            .map(|&i| Entry {
                handle: handle_of(i),
                name: self.name(i).to_string(),
            })
            .collect()
    }
}

fn handle_of(index: usize) -> ObjectHandle {
    index as ObjectHandle + 1
}

fn add_spec(state: &mut State, path: &str, spec: &NamespaceSpec) {
    let Some(namespace) = state.ensure_path(path) else {
        return;
    };
    for (name, value) in &spec.variables {
        state.push_variable(namespace, name, Ok(value.clone()));
    }
    for (child, child_spec) in &spec.namespaces {
        add_spec(state, &format!("{path}::{child}"), child_spec);
    }
}

/// A shared handle onto one simulated application. Clones see the same state.
#[derive(Debug, Clone)]
pub struct SimulatedApplication {
    state: Rc<RefCell<State>>,
}

impl Default for SimulatedApplication {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedApplication {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(State::new())),
        }
    }

    pub fn from_graph(graph: &SimulatedGraph) -> Self {
        let sim = Self::new();
        {
            let mut state = sim.state.borrow_mut();
            if let Some(identity) = &graph.application {
                state.identity = identity.clone();
            }
            for (name, spec) in &graph.namespaces {
                add_spec(&mut state, name, spec);
            }
            for (name, returns) in &graph.procedures {
                state.push_procedure(name, Ok(returns.clone()));
            }
        }
        sim
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| LinkError::Config(format!("cannot read '{}': {e}", path.display())))?;
        let graph: SimulatedGraph = serde_json::from_str(&text)
            .map_err(|e| LinkError::Config(format!("'{}': {e}", path.display())))?;
        Ok(Self::from_graph(&graph))
    }

    /// A connector that hands out links to this application.
    pub fn connector(&self) -> SimulatedConnector {
        SimulatedConnector { app: self.clone() }
    }

    pub fn set_identity(&self, name: &str, version: &str) {
        self.state.borrow_mut().identity = AppIdentity {
            name: name.to_string(),
            version: version.to_string(),
        };
    }

    pub fn add_namespace(&self, path: &str) {
        self.state.borrow_mut().ensure_path(path);
    }

    pub fn add_variable(&self, path: &str, name: &str, value: impl Into<Value>) {
        let mut state = self.state.borrow_mut();
        if let Some(namespace) = state.ensure_path(path) {
            state.push_variable(namespace, name, Ok(value.into()));
        }
    }

    /// A variable whose every read fails with `reason`.
    pub fn add_unreadable_variable(&self, path: &str, name: &str, reason: &str) {
        let mut state = self.state.borrow_mut();
        if let Some(namespace) = state.ensure_path(path) {
            state.push_variable(namespace, name, Err(reason.to_string()));
        }
    }

    /// Change a value from the application's side.
    pub fn set_value(&self, path: &str, name: &str, value: impl Into<Value>) {
        self.add_variable(path, name, value);
    }

    pub fn value_of(&self, path: &str, name: &str) -> Option<Value> {
        let state = self.state.borrow();
        let namespace = state.lookup_path(path)?;
        let index = state.variable_in(namespace, name)?;
        match &state.nodes[index] {
            Node::Variable { value: Ok(value), .. } => Some(value.clone()),
            _ => None,
        }
    }

    pub fn add_procedure(&self, name: &str, returns: Value) {
        self.state.borrow_mut().push_procedure(name, Ok(returns));
    }

    /// A CAPL function that reports `message` when called.
    pub fn add_failing_procedure(&self, name: &str, message: &str) {
        self.state
            .borrow_mut()
            .push_procedure(name, Err(message.to_string()));
    }

    pub fn procedure_calls(&self, name: &str) -> usize {
        let state = self.state.borrow();
        match state.procedure(name).map(|i| &state.nodes[i]) {
            Some(Node::Procedure { calls, .. }) => *calls,
            _ => 0,
        }
    }

    pub fn last_arguments(&self, name: &str) -> Option<Vec<Value>> {
        let state = self.state.borrow();
        match state.procedure(name).map(|i| &state.nodes[i]) {
            Some(Node::Procedure { last_args, .. }) => last_args.clone(),
            _ => None,
        }
    }

    pub fn fail_connect(&self, reason: &str) {
        self.state.borrow_mut().connect_failure = Some(reason.to_string());
    }

    pub fn fail_identity(&self, reason: &str) {
        self.state.borrow_mut().identity_failure = Some(reason.to_string());
    }

    /// Make the root namespace collection inaccessible.
    pub fn fail_root_listing(&self, reason: &str) {
        self.state.borrow_mut().root_failure = Some(reason.to_string());
    }

    /// Make lookups of the namespace at `path` raise instead of returning a miss.
    pub fn reject_namespace_lookup(&self, path: &str) {
        self.state
            .borrow_mut()
            .rejected_namespaces
            .push(path.to_string());
    }

    pub fn reject_creates(&self, reason: &str) {
        self.state.borrow_mut().create_failure = Some(reason.to_string());
    }

    /// Every remote call made so far, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    pub fn open_count(&self) -> usize {
        self.state.borrow().opens
    }

    pub fn is_released(&self) -> bool {
        self.state.borrow().released
    }

    /// Cut the open link as if the bridge process had died. Every later call
    /// on it fails with a transport error.
    pub fn break_link(&self) {
        self.state.borrow_mut().released = true;
    }
}

impl RemoteApplication for SimulatedApplication {
    fn identity(&mut self) -> Result<AppIdentity, RemoteError> {
        let mut state = self.state.borrow_mut();
        state.record("identity()".into())?;
        match &state.identity_failure {
            Some(reason) => Err(RemoteError::Remote(reason.clone())),
            None => Ok(state.identity.clone()),
        }
    }

    fn namespaces(&mut self, parent: Option<ObjectHandle>) -> Result<Vec<Entry>, RemoteError> {
        let mut state = self.state.borrow_mut();
        let parent = parent.map(|h| state.namespace_index(h)).transpose()?;
        let label = state.parent_label(parent);
        state.record(format!("namespaces({label})"))?;
        if parent.is_none() {
            if let Some(reason) = &state.root_failure {
                return Err(RemoteError::Remote(reason.clone()));
            }
        }
        Ok(state.entries(state.children(parent)))
    }

    fn find_namespace(
        &mut self,
        parent: Option<ObjectHandle>,
        name: &str,
    ) -> Result<Option<ObjectHandle>, RemoteError> {
        let mut state = self.state.borrow_mut();
        let parent = parent.map(|h| state.namespace_index(h)).transpose()?;
        let path = match parent {
            Some(p) => format!("{}::{name}", state.path(p)),
            None => name.to_string(),
        };
        state.record(format!("find_namespace({path})"))?;
        if state.rejected_namespaces.contains(&path) {
            return Err(RemoteError::Remote(format!("lookup of '{path}' rejected")));
        }
        Ok(state.child_namespace(parent, name).map(handle_of))
    }

    fn add_namespace(
        &mut self,
        parent: Option<ObjectHandle>,
        name: &str,
    ) -> Result<ObjectHandle, RemoteError> {
        let mut state = self.state.borrow_mut();
        let parent = parent.map(|h| state.namespace_index(h)).transpose()?;
        let label = state.parent_label(parent);
        state.record(format!("add_namespace({label}, {name})"))?;
        if let Some(reason) = &state.create_failure {
            return Err(RemoteError::Remote(reason.clone()));
        }
        if state.child_namespace(parent, name).is_some() {
            return Err(RemoteError::Remote(format!("namespace '{name}' already exists")));
        }
        Ok(handle_of(state.push_namespace(parent, name)))
    }

    fn variables(&mut self, namespace: ObjectHandle) -> Result<Vec<Entry>, RemoteError> {
        let mut state = self.state.borrow_mut();
        let namespace = state.namespace_index(namespace)?;
        let path = state.path(namespace);
        state.record(format!("variables({path})"))?;
        Ok(state.entries(state.variables_of(namespace)))
    }

    fn find_variable(
        &mut self,
        namespace: ObjectHandle,
        name: &str,
    ) -> Result<Option<ObjectHandle>, RemoteError> {
        let mut state = self.state.borrow_mut();
        let namespace = state.namespace_index(namespace)?;
        let path = state.path(namespace);
        state.record(format!("find_variable({path}, {name})"))?;
        Ok(state.variable_in(namespace, name).map(handle_of))
    }

    fn add_variable(
        &mut self,
        namespace: ObjectHandle,
        name: &str,
        initial: &Value,
    ) -> Result<ObjectHandle, RemoteError> {
        let mut state = self.state.borrow_mut();
        let namespace = state.namespace_index(namespace)?;
        let path = state.path(namespace);
        state.record(format!("add_variable({path}, {name}, {initial})"))?;
        if let Some(reason) = &state.create_failure {
            return Err(RemoteError::Remote(reason.clone()));
        }
        if state.variable_in(namespace, name).is_some() {
            return Err(RemoteError::Remote(format!(
                "variable '{path}::{name}' already exists"
            )));
        }
        Ok(handle_of(state.push_variable(namespace, name, Ok(initial.clone()))))
    }

    fn get_value(&mut self, variable: ObjectHandle) -> Result<Value, RemoteError> {
        let mut state = self.state.borrow_mut();
        let index = state.index(variable)?;
        let path = state.path(index);
        state.record(format!("get_value({path})"))?;
        match &state.nodes[index] {
            Node::Variable { value, .. } => value.clone().map_err(RemoteError::Remote),
            _ => Err(RemoteError::Remote(format!("'{path}' is not a variable"))),
        }
    }

    fn set_value(&mut self, variable: ObjectHandle, value: &Value) -> Result<(), RemoteError> {
        let mut state = self.state.borrow_mut();
        let index = state.index(variable)?;
        let path = state.path(index);
        state.record(format!("set_value({path}, {value})"))?;
        let current_kind = match &state.nodes[index] {
            Node::Variable { value: Ok(current), .. } => current.kind(),
            Node::Variable { value: Err(reason), .. } => {
                return Err(RemoteError::Remote(reason.clone()))
            }
            _ => return Err(RemoteError::Remote(format!("'{path}' is not a variable"))),
        };
        if current_kind != "null" && !value.is_null() && current_kind != value.kind() {
            return Err(RemoteError::Remote(format!(
                "type mismatch: '{path}' holds a {current_kind}, got a {}",
                value.kind()
            )));
        }
        if let Node::Variable { value: slot, .. } = &mut state.nodes[index] {
            *slot = Ok(value.clone());
        }
        Ok(())
    }

    fn find_procedure(&mut self, name: &str) -> Result<Option<ObjectHandle>, RemoteError> {
        let mut state = self.state.borrow_mut();
        state.record(format!("find_procedure({name})"))?;
        Ok(state.procedure(name).map(handle_of))
    }

    fn call_procedure(
        &mut self,
        procedure: ObjectHandle,
        args: &[Value],
    ) -> Result<Value, RemoteError> {
        let mut state = self.state.borrow_mut();
        let index = state.index(procedure)?;
        let name = state.name(index).to_string();
        state.record(format!("call_procedure({name})"))?;
        match &mut state.nodes[index] {
            Node::Procedure {
                outcome,
                calls,
                last_args,
                ..
            } => {
                *calls += 1;
                *last_args = Some(args.to_vec());
                outcome.clone().map_err(RemoteError::Remote)
            }
            _ => Err(RemoteError::Remote(format!("'{name}' is not a CAPL function"))),
        }
    }

    fn measurement_running(&mut self) -> Result<bool, RemoteError> {
        let mut state = self.state.borrow_mut();
        state.record("measurement_running()".into())?;
        Ok(state.measurement_running)
    }

    fn start_measurement(&mut self) -> Result<(), RemoteError> {
        let mut state = self.state.borrow_mut();
        state.record("start_measurement()".into())?;
        state.measurement_running = true;
        Ok(())
    }

    fn stop_measurement(&mut self) -> Result<(), RemoteError> {
        let mut state = self.state.borrow_mut();
        state.record("stop_measurement()".into())?;
        state.measurement_running = false;
        Ok(())
    }

    fn release(&mut self) -> Result<(), RemoteError> {
        let mut state = self.state.borrow_mut();
        state.calls.push("release()".into());
        state.released = true;
        Ok(())
    }
}

/// Opens links onto a [`SimulatedApplication`].
#[derive(Debug, Clone)]
pub struct SimulatedConnector {
    app: SimulatedApplication,
}

impl Connector for SimulatedConnector {
    fn open(&mut self) -> Result<Box<dyn RemoteApplication>, RemoteError> {
        {
            let mut state = self.app.state.borrow_mut();
            state.opens += 1;
            if let Some(reason) = &state.connect_failure {
                return Err(RemoteError::Unavailable(reason.clone()));
            }
            state.released = false;
        }
        Ok(Box::new(self.app.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_graph_from_json() {
        let graph: SimulatedGraph = serde_json::from_str(
            r#"{
                "application": { "name": "CANoe64", "version": "17.0.1" },
                "namespaces": {
                    "Measurement": { "variables": { "Temperature": 30.0 } },
                    "Vehicle": { "namespaces": { "Body": { "variables": { "DoorOpen": false } } } }
                },
                "procedures": { "ResetAll": null }
            }"#,
        )
        .unwrap();

        let sim = SimulatedApplication::from_graph(&graph);
        assert_eq!(sim.value_of("Measurement", "Temperature"), Some(Value::Number(30.0)));
        assert_eq!(sim.value_of("Vehicle::Body", "DoorOpen"), Some(Value::Bool(false)));
        assert_eq!(sim.value_of("Vehicle", "DoorOpen"), None);

        let mut app = sim.clone();
        assert!(app.find_procedure("ResetAll").is_err(), "not opened yet");

        let mut link = sim.connector().open().unwrap();
        assert_eq!(link.identity().unwrap().version, "17.0.1");
        assert!(link.find_procedure("ResetAll").unwrap().is_some());
    }

    #[test]
    fn test_released_link_refuses_calls() {
        let sim = SimulatedApplication::new();
        sim.add_namespace("General");
        let mut link = sim.connector().open().unwrap();
        assert_eq!(link.namespaces(None).unwrap().len(), 1);

        link.release().unwrap();
        assert!(matches!(
            link.namespaces(None),
            Err(RemoteError::Transport(_))
        ));
    }

    #[test]
    fn test_call_log_names_objects() {
        let sim = SimulatedApplication::new();
        sim.add_variable("Vehicle::Body", "DoorOpen", false);
        let mut link = sim.connector().open().unwrap();

        let vehicle = link.find_namespace(None, "Vehicle").unwrap().unwrap();
        let body = link.find_namespace(Some(vehicle), "Body").unwrap().unwrap();
        let door = link.find_variable(body, "DoorOpen").unwrap().unwrap();
        link.get_value(door).unwrap();

        assert_eq!(
            sim.calls(),
            vec![
                "find_namespace(Vehicle)",
                "find_namespace(Vehicle::Body)",
                "find_variable(Vehicle::Body, DoorOpen)",
                "get_value(Vehicle::Body::DoorOpen)",
            ]
        );
    }
}
