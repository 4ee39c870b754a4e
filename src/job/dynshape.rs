use log::{debug, info};

use crate::base::mem::{BufferDesc, DeviceMemory};
use crate::error::{Result, UmdError};
use crate::graph::IoKind;
use crate::job::io::IoBuffers;

/// Byte size of a tensor of `dims` elements; errors when it does not fit
/// the 32-bit size field.
fn tensor_bytes(kind: IoKind, index: usize, dims: &[u32], element_size: u32) -> Result<u32> {
    dims.iter()
        .try_fold(u64::from(element_size), |acc, &d| acc.checked_mul(u64::from(d)))
        .and_then(|bytes| u32::try_from(bytes).ok())
        .ok_or_else(|| UmdError::invalid_graph(format!("{} {}: shape {:?} too large", kind, index, dims)))
}

/// Input shapes of a dynamic-shape job and the output sizes they produce.
#[derive(Debug, Clone, Default)]
pub struct DynShape {
    inputs: Vec<Vec<u32>>,
    outputs_updated: bool,
}

impl DynShape {
    pub fn new(inputs: Vec<Vec<u32>>) -> Self {
        Self { inputs, outputs_updated: false }
    }

    pub fn is_configured(&self) -> bool {
        !self.inputs.is_empty()
    }

    pub fn input_shape(&self, index: usize) -> Option<&[u32]> {
        self.inputs.get(index).map(Vec::as_slice)
    }

    /// Copy the model's global parameter block to `buf` and append the
    /// configured input dimensions at the offset named by its first word.
    pub fn write_global_param(&self, mem: &dyn DeviceMemory, buf: &BufferDesc, blob: &[u8], input_count: usize) -> Result<()> {
        let header: [u8; 4] = blob
            .get(..4)
            .and_then(|h| h.try_into().ok())
            .ok_or_else(|| UmdError::invalid_graph("global param block shorter than its header"))?;
        mem.write(buf.pa, blob)?;

        let mut offset = u64::from(u32::from_le_bytes(header));
        for index in 0..input_count {
            let dims = self.input_shape(index).ok_or(UmdError::ShapeNotConfigured { index })?;
            for &dim in dims {
                mem.write_u32(buf.pa + offset, dim)?;
                offset += 4;
            }
        }
        debug!("global param: {} input shapes written", input_count);
        Ok(())
    }

    /// Size every input tensor after its configured shape.
    pub fn apply_input_sizes(&self, io: &mut IoBuffers) -> Result<()> {
        for index in 0..io.get(IoKind::Input).len() {
            let dims = self.input_shape(index).ok_or(UmdError::ShapeNotConfigured { index })?;
            let tensor = io.tensor_mut(IoKind::Input, index)?;
            tensor.size = tensor_bytes(IoKind::Input, index, dims, tensor.data_type.size())?;
        }
        Ok(())
    }

    /// Allow the next [`DynShape::update_output_sizes`] to read the shapes
    /// back again.
    pub fn new_run(&mut self) {
        self.outputs_updated = false;
    }

    /// Read the output shapes the model wrote back and resize the output
    /// tensors. Runs once per job run.
    pub fn update_output_sizes(&mut self, mem: &dyn DeviceMemory, io: &mut IoBuffers) -> Result<()> {
        if self.outputs_updated {
            return Ok(());
        }
        let shapes = io.get(IoKind::OutputShape).to_vec();
        let outputs = io.get(IoKind::Output).len();
        if shapes.len() != outputs {
            return Err(UmdError::UnmatchedOutShape { outputs, shapes: shapes.len() });
        }

        let mut sizes = Vec::with_capacity(outputs);
        for (index, shape) in shapes.iter().enumerate() {
            let mut raw = vec![0u8; (shape.size / 4 * 4) as usize];
            mem.read(shape.pa, &mut raw)?;
            let dims: Vec<u32> = raw.chunks_exact(4).map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]])).collect();
            if dims.contains(&0) {
                return Err(UmdError::ZeroTensorSize { index });
            }
            sizes.push(dims);
        }
        for (index, dims) in sizes.into_iter().enumerate() {
            let tensor = io.tensor_mut(IoKind::Output, index)?;
            tensor.size = tensor_bytes(IoKind::Output, index, &dims, tensor.data_type.size())?;
            info!("dynamic output {}: {} bytes", index, tensor.size);
        }
        self.outputs_updated = true;
        Ok(())
    }
}
