// Shader module loading
//
// Vulkan consumes SPIR-V: a stream of little-endian 32-bit words starting
// with a magic number. Shaders are compiled by build.rs and loaded from disk.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;

pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Turn raw bytes into SPIR-V words, rejecting anything that isn't SPIR-V.
pub fn decode_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.is_empty() {
        anyhow::bail!("Shader binary is empty");
    }

    // read_spv handles alignment and the size-multiple-of-4 check
    let words = ash::util::read_spv(&mut Cursor::new(bytes)).context("Malformed SPIR-V")?;

    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(&other) => anyhow::bail!("Not a SPIR-V binary (magic {:#010x})", other),
        None => anyhow::bail!("Shader binary is empty"),
    }
}

pub fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(code);

    unsafe { device.create_shader_module(&create_info, None) }
        .context("Failed to create shader module")
}

/// Load a compiled shader from disk. Missing files and invalid bytecode are
/// reported as errors naming the path.
pub fn load_shader_module(device: &ash::Device, path: &Path) -> Result<vk::ShaderModule> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read shader {:?} (was it compiled by glslc?)", path))?;
    let words = decode_spirv(&bytes).with_context(|| format!("Invalid shader {:?}", path))?;

    log::debug!("Loaded shader {:?} ({} words)", path, words.len());

    create_shader_module(device, &words)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn valid_header_is_accepted() {
        let bytes = words_to_bytes(&[SPIRV_MAGIC, 0x0001_0600, 0, 16, 0]);
        let words = decode_spirv(&bytes).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], SPIRV_MAGIC);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let bytes = words_to_bytes(&[0xdead_beef, 0, 0, 0, 0]);
        let err = decode_spirv(&bytes).unwrap_err();
        assert!(err.to_string().contains("Not a SPIR-V"));
    }

    #[test]
    fn truncated_and_empty_input_is_rejected() {
        let mut bytes = words_to_bytes(&[SPIRV_MAGIC, 0]);
        bytes.pop();
        assert!(decode_spirv(&bytes).is_err());
        assert!(decode_spirv(&[]).is_err());
    }
}
