//! CAPL function lookup and invocation.

use canoe_com_protocol::{ObjectHandle, Value};

use crate::error::{LinkError, RemoteError, Result};
use crate::session::Session;

/// A CAPL function looked up in one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureHandle {
    name: String,
    object: ObjectHandle,
    generation: u64,
}

impl ProcedureHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Session {
    /// Look up a CAPL function by name.
    pub fn lookup_procedure(&mut self, name: &str) -> Result<ProcedureHandle> {
        let link = self.ensure_connected()?;
        let generation = link.info.generation;

        match link.app.find_procedure(name) {
            Ok(Some(object)) => Ok(ProcedureHandle {
                name: name.to_string(),
                object,
                generation,
            }),
            Ok(None) => Err(LinkError::ProcedureNotFound(name.to_string())),
            Err(err) if err.is_link_lost() => Err(self.lose_link(&err)),
            Err(err) if err.is_transport() => Err(LinkError::from_remote(
                err,
                "procedure lookup",
                |message| LinkError::InvocationFailure {
                    procedure: name.to_string(),
                    message,
                },
            )),
            Err(err) => {
                tracing::debug!(procedure = name, "procedure lookup rejected: {err}");
                Err(LinkError::ProcedureNotFound(name.to_string()))
            }
        }
    }

    /// Call a looked-up function and return what it returned.
    pub fn call_procedure(&mut self, procedure: &ProcedureHandle, args: &[Value]) -> Result<Value> {
        let link = self.ensure_connected()?;
        let invocation_failure = |message: String| LinkError::InvocationFailure {
            procedure: procedure.name.clone(),
            message,
        };
        link.check_generation(procedure.generation)
            .map_err(invocation_failure)?;

        tracing::debug!(procedure = %procedure.name, args = args.len(), "calling CAPL function");
        let result = link.app.call_procedure(procedure.object, args);
        self.settle(result, |err| match err {
            RemoteError::Timeout(after) => LinkError::Timeout {
                operation: format!("call of '{}'", procedure.name),
                after,
            },
            other => invocation_failure(other.to_string()),
        })
    }

    /// Look up `name` and call it without arguments. Nothing is called if the lookup fails.
    pub fn invoke_procedure(&mut self, name: &str) -> Result<()> {
        self.invoke_procedure_with(name, &[]).map(|_| ())
    }

    /// Look up `name` and call it with `args`.
    pub fn invoke_procedure_with(&mut self, name: &str, args: &[Value]) -> Result<Value> {
        let procedure = self.lookup_procedure(name)?;
        let result = self.call_procedure(&procedure, args)?;
        tracing::info!(procedure = name, "CAPL function returned {result}");
        Ok(result)
    }
}
