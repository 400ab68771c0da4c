use ash::vk::{ShaderModule, ShaderModuleCreateInfo};
use ash::Device;
use byteorder::ReadBytesExt;
use std::fs::File;
use std::io;
use std::path::Path;

use crate::error::VkCallError;
use crate::vk_check;

pub fn load_spirv(path: &Path) -> io::Result<Vec<u32>> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    if len % 4 != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} is not a whole number of SPIR-V words", path.display()),
        ));
    }

    let mut buf_reader = io::BufReader::new(file);
    let mut buffer = vec![0; (len / 4) as usize];
    buf_reader.read_u32_into::<byteorder::NativeEndian>(&mut buffer[..])?;

    Ok(buffer)
}

pub fn create_shader_module(device: &Device, code: &[u32]) -> Result<ShaderModule, VkCallError> {
    let info = ShaderModuleCreateInfo::builder().code(code);
    vk_check!(unsafe { device.create_shader_module(&info, None) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_spirv_reads_native_endian_words() {
        let path = std::env::temp_dir().join("vk_utils_load_spirv_words.spv");
        let words: [u32; 2] = [0x0723_0203, 42];
        {
            let mut file = File::create(&path).unwrap();
            for word in words {
                file.write_all(&word.to_ne_bytes()).unwrap();
            }
        }
        assert_eq!(load_spirv(&path).unwrap(), words.to_vec());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn load_spirv_rejects_truncated_files() {
        let path = std::env::temp_dir().join("vk_utils_load_spirv_truncated.spv");
        File::create(&path).unwrap().write_all(&[1, 2, 3]).unwrap();
        let error = load_spirv(&path).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
        std::fs::remove_file(&path).unwrap();
    }
}
