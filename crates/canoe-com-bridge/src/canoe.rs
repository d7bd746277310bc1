//! The `CANoe.Application` object model, behind a table of numeric handles.

#![cfg(windows)]

use canoe_com_protocol::{AppIdentity, Entry, ObjectHandle, Value};

use crate::dispatch::{from_variant, to_variant, variant_i32, variant_str, DispatchObject};
use crate::handles::{HandleTable, Kind};

/// CAPL's `Call` takes at most this many parameters.
const MAX_CAPL_ARGS: usize = 10;

pub struct CanoeApp {
    app: DispatchObject,
    /// `Application.System.Namespaces`
    roots: DispatchObject,
    measurement: DispatchObject,
    capl: DispatchObject,
    handles: HandleTable<DispatchObject>,
}

impl CanoeApp {
    pub fn attach(prog_id: &str) -> Result<Self, String> {
        let app = DispatchObject::create(prog_id)?;
        let roots = app.object("System")?.object("Namespaces")?;
        let measurement = app.object("Measurement")?;
        let capl = app.object("CAPL")?;
        Ok(Self {
            app,
            roots,
            measurement,
            capl,
            handles: HandleTable::new(),
        })
    }

    pub fn identity(&self) -> Result<AppIdentity, String> {
        Ok(AppIdentity {
            name: self.app.get_string("Name")?,
            version: self.app.object("Version")?.get_string("FullName")?,
        })
    }

    fn lookup(&self, handle: ObjectHandle, want: Kind) -> Result<&DispatchObject, String> {
        self.handles.get(handle, want)
    }

    fn namespace_collection(&self, parent: Option<ObjectHandle>) -> Result<DispatchObject, String> {
        match parent {
            None => Ok(self.roots.clone()),
            Some(handle) => self.lookup(handle, Kind::Namespace)?.object("Namespaces"),
        }
    }

    fn variable_collection(&self, namespace: ObjectHandle) -> Result<DispatchObject, String> {
        self.lookup(namespace, Kind::Namespace)?.object("Variables")
    }

    /// Walk a collection by index; `Item(name)` raises on a miss, indistinguishable
    /// from a real failure.
    fn members(collection: &DispatchObject) -> Result<Vec<(String, DispatchObject)>, String> {
        let count = collection.count()?;
        let mut members = Vec::with_capacity(count.max(0) as usize);
        for index in 1..=count {
            let item = collection.item(variant_i32(index))?;
            members.push((item.get_string("Name")?, item));
        }
        Ok(members)
    }

    fn list(
        &mut self,
        collection: &DispatchObject,
        kind: Kind,
        parent: Option<ObjectHandle>,
    ) -> Result<Vec<Entry>, String> {
        let members = Self::members(collection)?;
        Ok(members
            .into_iter()
            .map(|(name, object)| Entry {
                handle: self.handles.intern(kind, parent, &name, object),
                name,
            })
            .collect())
    }

    fn find(
        &mut self,
        collection: &DispatchObject,
        name: &str,
        kind: Kind,
        parent: Option<ObjectHandle>,
    ) -> Result<Option<ObjectHandle>, String> {
        let found = Self::members(collection)?
            .into_iter()
            .find(|(member, _)| member == name);
        match found {
            Some((_, object)) => Ok(Some(self.handles.intern(kind, parent, name, object))),
            None => {
                self.handles.forget(kind, parent, name);
                Ok(None)
            }
        }
    }

    pub fn namespaces(&mut self, parent: Option<ObjectHandle>) -> Result<Vec<Entry>, String> {
        let collection = self.namespace_collection(parent)?;
        self.list(&collection, Kind::Namespace, parent)
    }

    pub fn find_namespace(
        &mut self,
        parent: Option<ObjectHandle>,
        name: &str,
    ) -> Result<Option<ObjectHandle>, String> {
        let collection = self.namespace_collection(parent)?;
        self.find(&collection, name, Kind::Namespace, parent)
    }

    pub fn add_namespace(&mut self, parent: Option<ObjectHandle>, name: &str) -> Result<ObjectHandle, String> {
        let collection = self.namespace_collection(parent)?;
        let namespace = collection.call_object("Add", &[variant_str(name)])?;
        Ok(self.handles.intern(Kind::Namespace, parent, name, namespace))
    }

    pub fn variables(&mut self, namespace: ObjectHandle) -> Result<Vec<Entry>, String> {
        let collection = self.variable_collection(namespace)?;
        self.list(&collection, Kind::Variable, Some(namespace))
    }

    pub fn find_variable(&mut self, namespace: ObjectHandle, name: &str) -> Result<Option<ObjectHandle>, String> {
        let collection = self.variable_collection(namespace)?;
        self.find(&collection, name, Kind::Variable, Some(namespace))
    }

    pub fn add_variable(
        &mut self,
        namespace: ObjectHandle,
        name: &str,
        initial: &Value,
    ) -> Result<ObjectHandle, String> {
        let collection = self.variable_collection(namespace)?;
        let variable = collection.call_object("Add", &[variant_str(name), to_variant(initial)])?;
        Ok(self.handles.intern(Kind::Variable, Some(namespace), name, variable))
    }

    pub fn get_value(&self, variable: ObjectHandle) -> Result<Value, String> {
        from_variant(&self.lookup(variable, Kind::Variable)?.get("Value")?)
    }

    pub fn set_value(&self, variable: ObjectHandle, value: &Value) -> Result<(), String> {
        self.lookup(variable, Kind::Variable)?
            .put("Value", to_variant(value))
    }

    /// `CAPL.GetFunction` raises for unknown names and for functions the
    /// compiled configuration does not export; both count as a miss.
    pub fn find_procedure(&mut self, name: &str) -> Result<Option<ObjectHandle>, String> {
        match self.capl.call_object("GetFunction", &[variant_str(name)]) {
            Ok(function) => Ok(Some(self.handles.intern(Kind::Function, None, name, function))),
            Err(e) => {
                eprintln!("[canoe-com-bridge] GetFunction('{name}'): {e}");
                self.handles.forget(Kind::Function, None, name);
                Ok(None)
            }
        }
    }

    pub fn call_procedure(&self, procedure: ObjectHandle, args: &[Value]) -> Result<Value, String> {
        if args.len() > MAX_CAPL_ARGS {
            return Err(format!(
                "CAPL functions take at most {MAX_CAPL_ARGS} arguments, got {}",
                args.len()
            ));
        }
        let function = self.lookup(procedure, Kind::Function)?;
        let args: Vec<_> = args.iter().map(to_variant).collect();
        from_variant(&function.call("Call", &args)?)
    }

    pub fn measurement_running(&self) -> Result<bool, String> {
        self.measurement.get_bool("Running")
    }

    pub fn start_measurement(&self) -> Result<(), String> {
        self.measurement.call("Start", &[]).map(|_| ())
    }

    pub fn stop_measurement(&self) -> Result<(), String> {
        self.measurement.call("Stop", &[]).map(|_| ())
    }

    /// Number of live handles.
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }
}
