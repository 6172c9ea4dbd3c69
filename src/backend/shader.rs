// Shader module loading
//
// Shaders are compiled to SPIR-V at build time (see build.rs) and loaded
// from disk at startup. A missing .spv file is a fatal startup error.

use ash::util::read_spv;
use ash::vk;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use super::DeviceContext;
use crate::error::{RenderError, RenderResult};

/// Load a SPIR-V file and wrap it in a shader module.
pub fn load_shader_module<P: AsRef<Path>>(
    device: &Arc<DeviceContext>,
    path: P,
) -> RenderResult<vk::ShaderModule> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|e| {
        RenderError::Init(format!(
            "failed to read shader {:?}: {e}. Run the build with glslc on PATH.",
            path
        ))
    })?;

    // SPIR-V is a stream of 4-byte words; read_spv checks size and alignment
    let code = read_spv(&mut Cursor::new(&bytes))
        .map_err(|e| RenderError::Init(format!("invalid SPIR-V in {:?}: {e}", path)))?;

    create_shader_module(device, &code)
}

pub fn create_shader_module(
    device: &Arc<DeviceContext>,
    code: &[u32],
) -> RenderResult<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(code);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .map_err(RenderError::from)
    }
}
