//! Filesystem resolver for imported script modules.

use elle_compiler::compiler::linker::{DependencyProvider, LinkError};
use elle_compiler::compiler::module::CompiledModule;
use elle_compiler::{compile_module, CompilerConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const EXT_SOURCE: &str = "l";
const EXT_COMPILED: &str = "lb";

/// Looks up imported modules beside the main source file, then under the
/// library path. A compiled `.lb` file is preferred when it is not older than
/// its `.l` source; freshly compiled dependencies are cached back to disk.
pub struct LocalDependencyProvider {
    base_dir: PathBuf,
    lib_dir: PathBuf,
    config: CompilerConfig,
    verbose: bool,
}

impl LocalDependencyProvider {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        lib_dir: impl Into<PathBuf>,
        config: CompilerConfig,
        verbose: bool,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            lib_dir: lib_dir.into(),
            config,
            verbose,
        }
    }

    fn find(&self, name: &str, ext: &str) -> Option<PathBuf> {
        let file_name = format!("{name}.{ext}");
        let local = self.base_dir.join(&file_name);
        if local.is_file() {
            return Some(local);
        }
        let library = self.lib_dir.join(&file_name);
        library.is_file().then_some(library)
    }

    fn log(&self, message: &str) {
        if self.verbose {
            eprintln!("{message}");
        }
    }

    fn load_compiled(&self, name: &str, path: &Path) -> Result<CompiledModule, LinkError> {
        let text = fs::read_to_string(path).map_err(|e| dependency_error(name, e))?;
        let module = CompiledModule::parse(name, &text).map_err(|e| dependency_error(name, e))?;
        self.log(&format!("linking with: {name} (compiled)"));
        Ok(module)
    }

    fn compile_source(&self, name: &str, path: &Path) -> Result<CompiledModule, LinkError> {
        let source = fs::read_to_string(path).map_err(|e| dependency_error(name, e))?;
        self.log(&format!("compiling: {name}"));
        let module = compile_module(name, &source, &self.config)
            .map_err(|e| dependency_error(name, e))?;

        // Cache the compiled form next to the source; best effort only
        let cache_path = path.with_extension(EXT_COMPILED);
        if let Ok(mut cache) = fs::File::create(cache_path) {
            let _ = module.write_to(&mut cache);
        }

        Ok(module)
    }
}

impl DependencyProvider for LocalDependencyProvider {
    fn get_dependency(&mut self, name: &str) -> Result<CompiledModule, LinkError> {
        let source_path = self.find(name, EXT_SOURCE);
        let compiled_path = self.find(name, EXT_COMPILED);

        match (source_path, compiled_path) {
            (None, None) => Err(LinkError::MissingDependency {
                name: name.to_string(),
            }),
            (None, Some(compiled)) => self.load_compiled(name, &compiled),
            (Some(source), None) => self.compile_source(name, &source),
            (Some(source), Some(compiled)) => {
                let fresh = match (mtime(&compiled), mtime(&source)) {
                    (Some(compiled_at), Some(source_at)) => compiled_at >= source_at,
                    _ => false,
                };
                if fresh {
                    self.load_compiled(name, &compiled)
                } else {
                    self.compile_source(name, &source)
                }
            }
        }
    }
}

fn dependency_error(
    name: &str,
    source: impl std::error::Error + Send + Sync + 'static,
) -> LinkError {
    LinkError::Dependency {
        name: name.to_string(),
        source: Box::new(source),
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
