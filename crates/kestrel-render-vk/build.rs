use std::{env, fs, path::PathBuf};

fn main() {
    let out = PathBuf::from(env::var("OUT_DIR").unwrap());

    // Vertex layout must match mesh::Vertex:
    //   - binding 0, location 0: R32G32B32_SFLOAT (position)
    //   - binding 0, location 1: R32G32B32_SFLOAT (normal)
    //   - binding 0, location 2: R32G32_SFLOAT    (uv)
    let vs_src = r#"
#version 450
layout(location = 0) in vec3 inPos;
layout(location = 1) in vec3 inNormal;
layout(location = 2) in vec2 inUv;

layout(set = 0, binding = 0) uniform Global { mat4 view; mat4 proj; } g;
layout(set = 0, binding = 1) uniform Instance { mat4 model; } inst;

layout(location = 0) out vec3 vNormal;
layout(location = 1) out vec2 vUv;

void main() {
    vNormal = mat3(inst.model) * inNormal;
    vUv = inUv;
    gl_Position = g.proj * g.view * inst.model * vec4(inPos, 1.0);
}
"#;

    // Half-lambert against a fixed light so untextured meshes still read as 3D.
    let fs_src = r#"
#version 450
layout(location = 0) in vec3 vNormal;
layout(location = 1) in vec2 vUv;

layout(set = 0, binding = 2) uniform sampler2D albedo;

layout(location = 0) out vec4 outColor;

void main() {
    vec3 light = normalize(vec3(-0.4, 0.8, -0.3));
    float lit = dot(normalize(vNormal), light) * 0.5 + 0.5;
    vec4 base = texture(albedo, vUv);
    outColor = vec4(base.rgb * lit, base.a);
}
"#;

    let comp = shaderc::Compiler::new().unwrap();
    let mut opts = shaderc::CompileOptions::new().unwrap();

    opts.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_0 as u32,
    );
    opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let vs_spv = comp
        .compile_into_spirv(
            vs_src,
            shaderc::ShaderKind::Vertex,
            "mesh.vert",
            "main",
            Some(&opts),
        )
        .unwrap();

    let fs_spv = comp
        .compile_into_spirv(
            fs_src,
            shaderc::ShaderKind::Fragment,
            "mesh.frag",
            "main",
            Some(&opts),
        )
        .unwrap();

    fs::write(out.join("mesh.vert.spv"), vs_spv.as_binary_u8()).unwrap();
    fs::write(out.join("mesh.frag.spv"), fs_spv.as_binary_u8()).unwrap();

    println!("cargo:rerun-if-changed=build.rs");
}
