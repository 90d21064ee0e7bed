//! The compiled-subgraph seam.
//!
//! Real deployments back this with a device runtime that ahead-of-time
//! compiles each sub-model for CPU, GPU, or NPU. The executor only depends on
//! the two traits here: [`GraphCompiler`] ("compile these model bytes for
//! accelerator X in environment E") and [`CompiledGraph`] ("run a named
//! signature over buffer maps"). Tests drive the executor with stub
//! implementations; production wires in the vendor runtime.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::buffer::{TensorBuffer, TensorType};
use crate::error::{EdgeLmError, Result};

/// Hardware accelerator a subgraph can be compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Accelerator {
    Cpu,
    Gpu,
    Npu,
}

impl std::fmt::Display for Accelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Accelerator::Cpu => "cpu",
            Accelerator::Gpu => "gpu",
            Accelerator::Npu => "npu",
        };
        write!(f, "{name}")
    }
}

impl FromStr for Accelerator {
    type Err = EdgeLmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Accelerator::Cpu),
            "gpu" => Ok(Accelerator::Gpu),
            "npu" => Ok(Accelerator::Npu),
            other => Err(EdgeLmError::InvalidArgument(format!(
                "unknown accelerator: {other}"
            ))),
        }
    }
}

/// Options for building an execution environment.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentOptions {
    /// Directory holding the vendor dispatch library, when the accelerator
    /// needs one loaded at runtime.
    pub dispatch_library_dir: Option<PathBuf>,
}

/// An explicit execution environment.
///
/// Deliberately not a process singleton: tests instantiate isolated
/// environments, and everything that compiles a graph takes one by reference.
pub struct Environment {
    options: EnvironmentOptions,
}

impl Environment {
    pub fn new(options: EnvironmentOptions) -> Self {
        match &options.dispatch_library_dir {
            Some(dir) => tracing::info!(dir = %dir.display(), "dispatch library directory set"),
            None => tracing::info!("no dispatch library directory provided"),
        }
        Environment { options }
    }

    pub fn dispatch_library_dir(&self) -> Option<&Path> {
        self.options.dispatch_library_dir.as_deref()
    }
}

/// Static description of one named tensor of a signature.
#[derive(Debug, Clone)]
pub struct TensorSpec {
    pub name: String,
    pub tensor_type: TensorType,
}

impl TensorSpec {
    pub fn new(name: &str, tensor_type: TensorType) -> Self {
        TensorSpec {
            name: name.to_string(),
            tensor_type,
        }
    }
}

/// A named entry point of a compiled subgraph: its input and output tensors
/// in declaration order.
#[derive(Debug, Clone)]
pub struct Signature {
    name: String,
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
}

impl Signature {
    pub fn new(name: &str, inputs: Vec<TensorSpec>, outputs: Vec<TensorSpec>) -> Self {
        Signature {
            name: name.to_string(),
            inputs,
            outputs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }

    pub fn input(&self, name: &str) -> Option<&TensorSpec> {
        self.inputs.iter().find(|t| t.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&TensorSpec> {
        self.outputs.iter().find(|t| t.name == name)
    }
}

/// Parameter-name → buffer binding for one `run` invocation.
pub type BufferMap = HashMap<String, TensorBuffer>;

/// A compiled subgraph, keyed by signature name.
pub trait CompiledGraph: Send {
    /// Look up a signature by name. Unknown names are `NotFound`.
    fn signature(&self, name: &str) -> Result<&Signature>;

    /// Execute one signature synchronously. Blocks until the device returns.
    ///
    /// The maps must bind every input and output tensor the signature
    /// declares; buffers may alias each other and buffers bound to other
    /// signatures.
    fn run(&self, signature: &str, inputs: &BufferMap, outputs: &BufferMap) -> Result<()>;

    /// Allocate a fresh, zeroed buffer matching a signature input.
    fn create_input_buffer(&self, signature: &str, input_name: &str) -> Result<TensorBuffer> {
        let sig = self.signature(signature)?;
        let spec = sig.input(input_name).ok_or_else(|| {
            EdgeLmError::NotFound(format!(
                "signature {signature} has no input named {input_name}"
            ))
        })?;
        Ok(TensorBuffer::new(spec.tensor_type.clone()))
    }

    /// Allocate a fresh, zeroed buffer matching a signature output.
    fn create_output_buffer(&self, signature: &str, output_name: &str) -> Result<TensorBuffer> {
        let sig = self.signature(signature)?;
        let spec = sig.output(output_name).ok_or_else(|| {
            EdgeLmError::NotFound(format!(
                "signature {signature} has no output named {output_name}"
            ))
        })?;
        Ok(TensorBuffer::new(spec.tensor_type.clone()))
    }
}

/// Capability to compile model bytes for a target accelerator.
pub trait GraphCompiler {
    fn compile(
        &self,
        env: &Environment,
        model_bytes: &[u8],
        accelerator: Accelerator,
    ) -> Result<Box<dyn CompiledGraph>>;
}
