// Build script to compile GLSL shaders to SPIR-V

use std::path::Path;
use std::process::Command;

const SHADERS: &[&str] = &[
    "reflect.vert",
    "reflect.frag",
    "textured.vert",
    "textured.frag",
    "skybox.vert",
    "skybox.frag",
];

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    // Compile shaders using glslc (part of Vulkan SDK)
    for shader in SHADERS {
        let input = format!("shaders/{shader}");
        let output = format!("shaders/{shader}.spv");
        if !compile_shader(&input, &output) {
            // Without glslc nothing else will compile either
            break;
        }
    }
}

/// Returns false when glslc is not available
fn compile_shader(input: &str, output: &str) -> bool {
    let input_path = Path::new(input);
    let output_path = Path::new(output);

    let result = Command::new("glslc")
        .arg(input_path)
        .arg("-I")
        .arg("shaders")
        .arg("-o")
        .arg(output_path)
        .status();

    match result {
        Ok(status) if status.success() => {
            println!("Compiled {} -> {}", input, output);
            true
        }
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}), shaders were not compiled", e);
            println!("cargo:warning=Install the Vulkan SDK or compile manually:");
            println!("cargo:warning=  glslc -I shaders {} -o {}", input, output);
            false
        }
    }
}
