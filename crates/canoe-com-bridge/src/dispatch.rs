//! Late-bound COM automation over `IDispatch`.
//!
//! CANoe's object model is only reachable the way a script host reaches it:
//! look a member up by name, then `Invoke` it as a property get, property put
//! or method call. Everything funnels through [`DispatchObject::invoke`].

#![cfg(windows)]

use std::mem::ManuallyDrop;
use std::ptr;

use canoe_com_protocol::Value;
use windows::{
    core::{BSTR, GUID, HSTRING, PCWSTR},
    Win32::{
        Foundation::{DISP_E_EXCEPTION, VARIANT_BOOL},
        Globalization::GetSystemDefaultLCID,
        System::{
            Com::{
                CLSIDFromProgID, CoCreateInstance, IDispatch, CLSCTX_LOCAL_SERVER, DISPATCH_FLAGS,
                DISPATCH_METHOD, DISPATCH_PROPERTYGET, DISPATCH_PROPERTYPUT, DISPPARAMS,
                EXCEPINFO,
            },
            Ole::DISPID_PROPERTYPUT,
            Variant::{
                VARIANT, VT_BOOL, VT_BSTR, VT_DISPATCH, VT_EMPTY, VT_I2, VT_I4, VT_NULL, VT_R4,
                VT_R8, VT_UI1, VT_UI4,
            },
        },
    },
};

// The VARIANT unions are wrapped in ManuallyDrop, so fields are set with
// ptr::write rather than through DerefMut.

fn variant_bool(val: bool) -> VARIANT {
    unsafe {
        let mut v = VARIANT::default();
        let inner = &mut *v.Anonymous.Anonymous;
        ptr::write(&mut inner.vt, VT_BOOL);
        ptr::write(
            &mut inner.Anonymous.boolVal,
            VARIANT_BOOL(if val { -1 } else { 0 }),
        );
        v
    }
}

fn variant_f64(val: f64) -> VARIANT {
    unsafe {
        let mut v = VARIANT::default();
        let inner = &mut *v.Anonymous.Anonymous;
        ptr::write(&mut inner.vt, VT_R8);
        ptr::write(&mut inner.Anonymous.dblVal, val);
        v
    }
}

pub fn variant_i32(val: i32) -> VARIANT {
    unsafe {
        let mut v = VARIANT::default();
        let inner = &mut *v.Anonymous.Anonymous;
        ptr::write(&mut inner.vt, VT_I4);
        ptr::write(&mut inner.Anonymous.lVal, val);
        v
    }
}

pub fn variant_str(val: &str) -> VARIANT {
    unsafe {
        let mut v = VARIANT::default();
        let inner = &mut *v.Anonymous.Anonymous;
        ptr::write(&mut inner.vt, VT_BSTR);
        ptr::write(&mut inner.Anonymous.bstrVal, ManuallyDrop::new(BSTR::from(val)));
        v
    }
}

/// Protocol value to VARIANT. `Null` becomes `VT_EMPTY`.
pub fn to_variant(value: &Value) -> VARIANT {
    match value {
        Value::Null => VARIANT::default(),
        Value::Bool(b) => variant_bool(*b),
        Value::Number(n) => variant_f64(*n),
        Value::String(s) => variant_str(s),
    }
}

/// VARIANT to protocol value. Arrays and objects are not scalar and fail.
pub fn from_variant(v: &VARIANT) -> Result<Value, String> {
    unsafe {
        let vt = v.Anonymous.Anonymous.vt;
        let data = &v.Anonymous.Anonymous.Anonymous;
        let value = if vt == VT_EMPTY || vt == VT_NULL {
            Value::Null
        } else if vt == VT_BOOL {
            Value::Bool(data.boolVal.0 != 0)
        } else if vt == VT_R8 {
            Value::Number(data.dblVal)
        } else if vt == VT_R4 {
            Value::Number(data.fltVal as f64)
        } else if vt == VT_I4 {
            Value::Number(data.lVal as f64)
        } else if vt == VT_UI4 {
            Value::Number(data.ulVal as f64)
        } else if vt == VT_I2 {
            Value::Number(data.iVal as f64)
        } else if vt == VT_UI1 {
            Value::Number(data.bVal as f64)
        } else if vt == VT_BSTR {
            Value::String(data.bstrVal.to_string())
        } else {
            return Err(format!("unsupported value type (VT={})", vt.0));
        };
        Ok(value)
    }
}

fn variant_dispatch(v: &VARIANT) -> Option<IDispatch> {
    unsafe {
        if v.Anonymous.Anonymous.vt == VT_DISPATCH {
            let disp: &Option<IDispatch> = &v.Anonymous.Anonymous.Anonymous.pdispVal;
            disp.clone()
        } else {
            None
        }
    }
}

/// An `IDispatch` pointer. Dropping it releases the reference.
#[derive(Clone)]
pub struct DispatchObject {
    inner: IDispatch,
}

impl DispatchObject {
    /// Attach to the local server registered under `prog_id`.
    pub fn create(prog_id: &str) -> Result<Self, String> {
        unsafe {
            let clsid = CLSIDFromProgID(&HSTRING::from(prog_id))
                .map_err(|e| format!("'{prog_id}' is not registered: {e}"))?;
            let inner: IDispatch = CoCreateInstance(&clsid, None, CLSCTX_LOCAL_SERVER)
                .map_err(|e| format!("cannot attach to '{prog_id}': {e}"))?;
            Ok(Self { inner })
        }
    }

    fn dispid(&self, name: &str) -> Result<i32, String> {
        let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
        let names = [PCWSTR(wide.as_ptr())];
        let mut dispid = 0i32;
        unsafe {
            self.inner
                .GetIDsOfNames(
                    &GUID::zeroed(),
                    names.as_ptr(),
                    1,
                    GetSystemDefaultLCID(),
                    &mut dispid,
                )
                .map_err(|e| format!("no member '{name}': {e}"))?;
        }
        Ok(dispid)
    }

    /// `args` are in call order; DISPPARAMS wants them reversed.
    fn invoke(&self, name: &str, flags: DISPATCH_FLAGS, args: &[VARIANT]) -> Result<VARIANT, String> {
        let dispid = self.dispid(name)?;
        let mut rgvarg: Vec<VARIANT> = args.iter().rev().cloned().collect();
        let mut named = [DISPID_PROPERTYPUT];
        let is_put = flags == DISPATCH_PROPERTYPUT;

        let params = DISPPARAMS {
            rgvarg: if rgvarg.is_empty() {
                ptr::null_mut()
            } else {
                rgvarg.as_mut_ptr()
            },
            rgdispidNamedArgs: if is_put {
                named.as_mut_ptr()
            } else {
                ptr::null_mut()
            },
            cArgs: rgvarg.len() as u32,
            cNamedArgs: u32::from(is_put),
        };

        let mut result = VARIANT::default();
        let mut except = EXCEPINFO::default();
        unsafe {
            self.inner
                .Invoke(
                    dispid,
                    &GUID::zeroed(),
                    GetSystemDefaultLCID(),
                    flags,
                    &params,
                    if is_put { None } else { Some(&mut result) },
                    Some(&mut except),
                    None,
                )
                .map_err(|e| describe_failure(e, &except, name))?;
        }
        Ok(result)
    }

    pub fn get(&self, name: &str) -> Result<VARIANT, String> {
        self.invoke(name, DISPATCH_PROPERTYGET, &[])
    }

    pub fn put(&self, name: &str, value: VARIANT) -> Result<(), String> {
        self.invoke(name, DISPATCH_PROPERTYPUT, &[value]).map(|_| ())
    }

    pub fn call(&self, name: &str, args: &[VARIANT]) -> Result<VARIANT, String> {
        self.invoke(name, DISPATCH_METHOD, args)
    }

    /// A property that holds another object, e.g. `Application.System`.
    pub fn object(&self, name: &str) -> Result<DispatchObject, String> {
        expect_object(self.get(name)?, name)
    }

    /// A collection item, e.g. `Namespaces.Item(3)`.
    pub fn item(&self, index: VARIANT) -> Result<DispatchObject, String> {
        expect_object(self.invoke("Item", DISPATCH_PROPERTYGET, &[index])?, "Item")
    }

    /// A method that returns an object, e.g. `Variables.Add(name, value)`.
    pub fn call_object(&self, name: &str, args: &[VARIANT]) -> Result<DispatchObject, String> {
        expect_object(self.call(name, args)?, name)
    }

    pub fn get_string(&self, name: &str) -> Result<String, String> {
        match from_variant(&self.get(name)?)? {
            Value::String(s) => Ok(s),
            other => Ok(other.to_string()),
        }
    }

    pub fn get_bool(&self, name: &str) -> Result<bool, String> {
        match from_variant(&self.get(name)?)? {
            Value::Bool(b) => Ok(b),
            Value::Number(n) => Ok(n != 0.0),
            other => Err(format!("'{name}' is {}, not a flag", other.kind())),
        }
    }

    pub fn count(&self) -> Result<i32, String> {
        match from_variant(&self.get("Count")?)? {
            Value::Number(n) => Ok(n as i32),
            other => Err(format!("'Count' is {}, not a number", other.kind())),
        }
    }
}

fn expect_object(variant: VARIANT, member: &str) -> Result<DispatchObject, String> {
    match variant_dispatch(&variant) {
        Some(inner) => Ok(DispatchObject { inner }),
        None => Err(format!(
            "'{member}' did not return an object (VT={})",
            unsafe { variant.Anonymous.Anonymous.vt.0 }
        )),
    }
}

/// The application's own message when it raised an exception, otherwise the HRESULT.
fn describe_failure(err: windows::core::Error, except: &EXCEPINFO, member: &str) -> String {
    if err.code() == DISP_E_EXCEPTION && !except.bstrDescription.is_empty() {
        except.bstrDescription.to_string()
    } else if err.code() == DISP_E_EXCEPTION {
        format!("'{member}' raised an exception without a description")
    } else {
        format!("'{member}' failed: {err}")
    }
}
