// Shader compiler - WGSL source to SPIR-V bytecode
//
// The device owns one of these. Given a named source unit and a stage it
// returns opaque bytecode, or fails with the compiler diagnostics, which are
// also written to the log.
//
// Binding conventions expected by the backend:
// - vertex stage constant buffer slot N  -> @group(0) @binding(N)
// - pixel stage constant buffer slot N   -> @group(0) @binding(8 + N)
// - input element N of an input layout   -> @location(N)

use std::path::{Path, PathBuf};

use super::error::{RhiError, RhiResult};
use super::types::ShaderStage;

/// Compiled shader for one stage
#[derive(Debug, Clone)]
pub struct ShaderBytecode {
    name: String,
    stage: ShaderStage,
    entry_point: String,
    words: Vec<u32>,
    /// Vertex input locations the entry point reads, sorted
    input_locations: Vec<u32>,
}

impl ShaderBytecode {
    pub(crate) fn new(
        name: impl Into<String>,
        stage: ShaderStage,
        entry_point: impl Into<String>,
        words: Vec<u32>,
        input_locations: Vec<u32>,
    ) -> Self {
        Self {
            name: name.into(),
            stage,
            entry_point: entry_point.into(),
            words,
            input_locations,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn data(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }

    pub fn size(&self) -> usize {
        self.words.len() * std::mem::size_of::<u32>()
    }

    pub fn input_locations(&self) -> &[u32] {
        &self.input_locations
    }
}

pub struct ShaderCompiler {
    source_dir: PathBuf,
}

impl Default for ShaderCompiler {
    fn default() -> Self {
        Self::new("shaders")
    }
}

impl ShaderCompiler {
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
        }
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    /// Compile `name` (relative to the source directory) for `stage`.
    pub fn compile_file(&self, name: &str, stage: ShaderStage) -> RhiResult<ShaderBytecode> {
        let path = self.source_dir.join(name);
        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(source) => {
                log::error!("Shader source not found: {:?} ({})", path, source);
                return Err(RhiError::ShaderSource { path, source });
            }
        };

        self.compile_source(name, &source, stage)
    }

    /// Compile the first entry point of `stage` found in `source`.
    pub fn compile_source(
        &self,
        name: &str,
        source: &str,
        stage: ShaderStage,
    ) -> RhiResult<ShaderBytecode> {
        let result = compile_wgsl(name, source, stage);
        match &result {
            Ok(bytecode) => log::debug!(
                "Compiled {:?} shader '{}' ({} bytes, entry '{}')",
                stage,
                name,
                bytecode.size(),
                bytecode.entry_point()
            ),
            Err(e) => log::error!("{}", e),
        }
        result
    }
}

fn compile_wgsl(name: &str, source: &str, stage: ShaderStage) -> RhiResult<ShaderBytecode> {
    let fail = |details: String| RhiError::ShaderCompilation {
        name: name.to_string(),
        details,
    };

    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| fail(format!("WGSL parse error: {e}")))?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    let info = validator
        .validate(&module)
        .map_err(|e| fail(format!("Validation error: {e}")))?;

    let naga_stage = match stage {
        ShaderStage::Vertex => naga::ShaderStage::Vertex,
        ShaderStage::Pixel => naga::ShaderStage::Fragment,
    };
    let entry_point = module
        .entry_points
        .iter()
        .find(|ep| ep.stage == naga_stage)
        .ok_or_else(|| fail(format!("no {stage:?} entry point")))?;

    let input_locations = if stage == ShaderStage::Vertex {
        vertex_input_locations(&module, entry_point)
    } else {
        Vec::new()
    };

    let options = naga::back::spv::Options {
        lang_version: (1, 3),
        ..Default::default()
    };
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: naga_stage,
        entry_point: entry_point.name.clone(),
    };
    let words = naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options))
        .map_err(|e| fail(format!("SPIR-V generation error: {e}")))?;

    Ok(ShaderBytecode::new(
        name,
        stage,
        entry_point.name.clone(),
        words,
        input_locations,
    ))
}

fn vertex_input_locations(module: &naga::Module, entry_point: &naga::EntryPoint) -> Vec<u32> {
    let mut locations = Vec::new();

    for argument in &entry_point.function.arguments {
        match &argument.binding {
            Some(naga::Binding::Location { location, .. }) => locations.push(*location),
            Some(naga::Binding::BuiltIn(_)) => {}
            None => {
                if let naga::TypeInner::Struct { members, .. } = &module.types[argument.ty].inner {
                    locations.extend(members.iter().filter_map(|member| match member.binding {
                        Some(naga::Binding::Location { location, .. }) => Some(location),
                        _ => None,
                    }));
                }
            }
        }
    }

    locations.sort_unstable();
    locations
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRIANGLE: &str = r#"
struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) color: vec3<f32>,
}

@vertex
fn vs_main(@location(0) position: vec2<f32>, @location(1) color: vec3<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.position = vec4<f32>(position, 0.0, 1.0);
    out.color = color;
    return out;
}

@fragment
fn ps_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return vec4<f32>(in.color, 1.0);
}
"#;

    #[test]
    fn compiles_both_stages() {
        let compiler = ShaderCompiler::default();

        let vs = compiler
            .compile_source("triangle", TRIANGLE, ShaderStage::Vertex)
            .unwrap();
        assert_eq!(vs.entry_point(), "vs_main");
        assert_eq!(vs.input_locations(), &[0, 1]);
        assert_eq!(vs.size(), vs.data().len());
        assert_eq!(vs.words()[0], 0x0723_0203);

        let ps = compiler
            .compile_source("triangle", TRIANGLE, ShaderStage::Pixel)
            .unwrap();
        assert_eq!(ps.entry_point(), "ps_main");
        assert!(ps.input_locations().is_empty());
    }

    #[test]
    fn struct_inputs_are_reflected() {
        let source = r#"
struct VertexInput {
    @location(2) uv: vec2<f32>,
    @location(0) position: vec3<f32>,
}

@vertex
fn main(input: VertexInput, @builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    return vec4<f32>(input.position + vec3<f32>(input.uv, f32(index)), 1.0);
}
"#;
        let vs = ShaderCompiler::default()
            .compile_source("struct_input", source, ShaderStage::Vertex)
            .unwrap();
        assert_eq!(vs.input_locations(), &[0, 2]);
    }

    #[test]
    fn syntax_errors_are_reported() {
        let err = ShaderCompiler::default()
            .compile_source("broken", "fn vs_main( {", ShaderStage::Vertex)
            .unwrap_err();
        assert!(matches!(err, RhiError::ShaderCompilation { ref name, .. } if name == "broken"));
    }

    #[test]
    fn missing_stage_is_an_error() {
        let source = "@fragment fn main() -> @location(0) vec4<f32> { return vec4<f32>(1.0); }";
        let err = ShaderCompiler::default()
            .compile_source("pixel_only", source, ShaderStage::Vertex)
            .unwrap_err();
        assert!(err.to_string().contains("no Vertex entry point"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let compiler = ShaderCompiler::new("does/not/exist");
        let err = compiler
            .compile_file("nothing.wgsl", ShaderStage::Vertex)
            .unwrap_err();
        assert!(matches!(err, RhiError::ShaderSource { .. }));
    }
}
