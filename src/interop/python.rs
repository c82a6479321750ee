//! Bridge between foreign values and real Python objects
//!
//! Arrays become numpy arrays when numpy is importable and
//! `{"data", "shape", "dtype"}` dicts otherwise.

use std::collections::BTreeMap;
use std::collections::HashMap;

use pyo3::exceptions::{PyKeyError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyDict, PyFloat, PyList, PyLong, PyString, PyTuple};

use crate::error::GraphError;
use crate::graph::SameDiff;
use crate::ops::{OpBuilder, OpType};
use crate::graph::OpArgs;
use crate::tensor::{DType, NdArray, Shape};
use super::ForeignValue;

fn to_py_err(err: GraphError) -> PyErr {
    PyValueError::new_err(err.to_string())
}

/// Python object for a foreign value
pub fn to_py(py: Python<'_>, value: &ForeignValue) -> PyResult<PyObject> {
    Ok(match value {
        ForeignValue::None => py.None(),
        ForeignValue::Bool(b) => b.to_object(py),
        ForeignValue::Int(i) => i.to_object(py),
        ForeignValue::Float(f) => f.to_object(py),
        ForeignValue::Str(s) => s.to_object(py),
        ForeignValue::List(items) => {
            let list = PyList::empty(py);
            for item in items {
                list.append(to_py(py, item)?)?;
            }
            list.to_object(py)
        }
        ForeignValue::Dict(entries) => {
            let dict = PyDict::new(py);
            for (k, v) in entries {
                dict.set_item(k, to_py(py, v)?)?;
            }
            dict.to_object(py)
        }
        ForeignValue::NdArray(array) => array_to_py(py, array)?,
    })
}

fn array_to_py(py: Python<'_>, array: &NdArray) -> PyResult<PyObject> {
    let data = PyList::new(py, array.data());
    let shape = PyTuple::new(py, array.shape());
    let dtype = array.dtype().to_numpy_dtype();
    match py.import("numpy") {
        Ok(numpy) => {
            let kwargs = PyDict::new(py);
            kwargs.set_item("dtype", dtype)?;
            let flat = numpy.call_method("array", (data,), Some(kwargs))?;
            Ok(flat.call_method1("reshape", (shape,))?.to_object(py))
        }
        Err(_) => {
            let dict = PyDict::new(py);
            dict.set_item("data", data)?;
            dict.set_item("shape", shape)?;
            dict.set_item("dtype", dtype)?;
            Ok(dict.to_object(py))
        }
    }
}

/// Foreign value for a Python object
pub fn from_py(obj: &PyAny) -> PyResult<ForeignValue> {
    if obj.is_none() {
        return Ok(ForeignValue::None);
    }
    // bool is a subclass of int, so it goes first
    if obj.is_instance_of::<PyBool>() {
        return Ok(ForeignValue::Bool(obj.extract()?));
    }
    if obj.is_instance_of::<PyLong>() {
        return Ok(ForeignValue::Int(obj.extract()?));
    }
    if obj.is_instance_of::<PyFloat>() {
        return Ok(ForeignValue::Float(obj.extract()?));
    }
    if obj.is_instance_of::<PyString>() {
        return Ok(ForeignValue::Str(obj.extract()?));
    }
    if let Ok(list) = obj.downcast::<PyList>() {
        return list.iter().map(from_py).collect::<PyResult<Vec<_>>>().map(ForeignValue::List);
    }
    if let Ok(tuple) = obj.downcast::<PyTuple>() {
        return tuple.iter().map(from_py).collect::<PyResult<Vec<_>>>().map(ForeignValue::List);
    }
    if let Ok(dict) = obj.downcast::<PyDict>() {
        let mut entries = BTreeMap::new();
        for (k, v) in dict.iter() {
            entries.insert(k.str()?.to_string(), from_py(v)?);
        }
        return Ok(ForeignValue::Dict(entries));
    }
    if obj.hasattr("shape")? && obj.hasattr("dtype")? && obj.hasattr("ravel")? {
        return py_to_array(obj).map(ForeignValue::NdArray);
    }
    Err(PyValueError::new_err(format!(
        "cannot convert Python {} to a foreign value",
        obj.get_type().name()?
    )))
}

fn py_to_array(obj: &PyAny) -> PyResult<NdArray> {
    let shape: Vec<usize> = obj.getattr("shape")?.extract()?;
    let dtype_name: String = obj.getattr("dtype")?.str()?.to_string();
    let dtype = DType::from_numpy_dtype(&dtype_name)
        .ok_or_else(|| PyValueError::new_err(format!("unsupported numpy dtype '{}'", dtype_name)))?;
    let data: Vec<f64> = obj
        .call_method0("ravel")?
        .call_method1("astype", ("float64",))?
        .call_method0("tolist")?
        .extract()?;
    NdArray::new(&shape, dtype, data).map_err(to_py_err)
}

/// A computation graph driven from Python
#[pyclass(name = "SameDiff")]
pub struct PySameDiff {
    graph: SameDiff,
}

#[pymethods]
impl PySameDiff {
    #[new]
    fn new() -> Self {
        Self { graph: SameDiff::new() }
    }

    /// Declare a placeholder; `None` entries in `shape` are unknown dims
    #[pyo3(signature = (name, dtype="float32", shape=None))]
    fn placeholder(&mut self, name: &str, dtype: &str, shape: Option<Vec<Option<usize>>>) -> PyResult<String> {
        let dtype = parse_dtype(dtype)?;
        let shape = shape.map(Shape::from_dims).unwrap_or_else(Shape::unknown);
        self.graph.placeholder(name, dtype, shape).map_err(to_py_err)
    }

    fn constant(&mut self, name: &str, value: &PyAny) -> PyResult<String> {
        let array = any_to_array(value)?;
        self.graph.constant(name, array).map_err(to_py_err)
    }

    fn var(&mut self, name: &str, value: &PyAny) -> PyResult<String> {
        let array = any_to_array(value)?;
        self.graph.var(name, array).map_err(to_py_err)
    }

    /// Add an op by its registered type name; returns the output names
    #[pyo3(signature = (op_type, inputs, name=None, ints=None, floats=None, bools=None))]
    fn op(
        &mut self,
        op_type: &str,
        inputs: Vec<String>,
        name: Option<&str>,
        ints: Option<Vec<i64>>,
        floats: Option<Vec<f64>>,
        bools: Option<Vec<bool>>,
    ) -> PyResult<Vec<String>> {
        let op_type = OpType::from_name(op_type).map_err(to_py_err)?;
        let args = OpArgs::new()
            .with_ints(&ints.unwrap_or_default())
            .with_floats(&floats.unwrap_or_default())
            .with_bools(&bools.unwrap_or_default());
        let inputs: Vec<&str> = inputs.iter().map(String::as_str).collect();
        self.graph.add_op(name, op_type, args, &inputs).map_err(to_py_err)
    }

    fn set_loss_variables(&mut self, names: Vec<String>) -> PyResult<()> {
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        self.graph.set_loss_variables(&names).map_err(to_py_err)
    }

    #[pyo3(signature = (outputs, placeholders=None))]
    fn execute(&self, py: Python<'_>, outputs: Vec<String>, placeholders: Option<&PyDict>) -> PyResult<PyObject> {
        let bindings = bindings_from(placeholders)?;
        let outputs: Vec<&str> = outputs.iter().map(String::as_str).collect();
        let values = py
            .allow_threads(|| self.graph.execute(&outputs, &bindings))
            .map_err(to_py_err)?;
        arrays_to_dict(py, values)
    }

    /// Gradients of the loss variables, keyed by variable name
    #[pyo3(signature = (placeholders=None, wrt=None))]
    fn calculate_gradients(
        &mut self,
        py: Python<'_>,
        placeholders: Option<&PyDict>,
        wrt: Option<Vec<String>>,
    ) -> PyResult<PyObject> {
        let bindings = bindings_from(placeholders)?;
        let wrt = wrt.unwrap_or_default();
        let wrt: Vec<&str> = wrt.iter().map(String::as_str).collect();
        let grads = self.graph.calculate_gradients(&bindings, &wrt).map_err(to_py_err)?;
        arrays_to_dict(py, grads)
    }

    fn summary(&self) -> String {
        self.graph.summary()
    }

    fn __repr__(&self) -> String {
        format!(
            "SameDiff(variables={}, operations={})",
            self.graph.num_variables(),
            self.graph.num_operations()
        )
    }
}

fn parse_dtype(name: &str) -> PyResult<DType> {
    DType::from_numpy_dtype(name).ok_or_else(|| PyValueError::new_err(format!("unknown dtype '{}'", name)))
}

fn any_to_array(value: &PyAny) -> PyResult<NdArray> {
    match from_py(value)? {
        ForeignValue::NdArray(array) => Ok(array),
        ForeignValue::Float(f) => Ok(NdArray::scalar(f, DType::F32)),
        ForeignValue::Int(i) => Ok(NdArray::scalar(i as f64, DType::I64)),
        ForeignValue::Bool(b) => Ok(NdArray::scalar(f64::from(u8::from(b)), DType::Bool)),
        ForeignValue::List(items) => {
            let data = items
                .iter()
                .map(|item| match item {
                    ForeignValue::Float(f) => Ok(*f),
                    ForeignValue::Int(i) => Ok(*i as f64),
                    other => Err(PyValueError::new_err(format!("nested {} in array data", other.type_name()))),
                })
                .collect::<PyResult<Vec<f64>>>()?;
            let len = data.len();
            NdArray::new(&[len], DType::F32, data).map_err(to_py_err)
        }
        other => Err(PyValueError::new_err(format!("cannot make an array from {}", other.type_name()))),
    }
}

fn bindings_from(placeholders: Option<&PyDict>) -> PyResult<HashMap<String, NdArray>> {
    let mut bindings = HashMap::new();
    if let Some(dict) = placeholders {
        for (k, v) in dict.iter() {
            let name: String = k.extract().map_err(|_| PyKeyError::new_err("placeholder names must be strings"))?;
            bindings.insert(name, any_to_array(v)?);
        }
    }
    Ok(bindings)
}

fn arrays_to_dict(py: Python<'_>, values: HashMap<String, NdArray>) -> PyResult<PyObject> {
    let dict = PyDict::new(py);
    for (name, array) in values {
        dict.set_item(name, array_to_py(py, &array)?)?;
    }
    Ok(dict.to_object(py))
}

/// Python module entry point
#[pymodule]
fn samediff(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PySameDiff>()?;
    m.add("__version__", crate::version())?;
    Ok(())
}
