//! In-process standard library.
//!
//! Functions are looked up by exact name in a [`StdLib`] registry. A single
//! lookup both answers "is this a stdlib function" and yields the handler, so
//! dispatch cannot disagree with the existence check.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::env::EnvStore;
use crate::error::{ShellError, ShellResult};

/// A callable stdlib entry. Arguments arrive already expanded.
pub trait StdFunction: Send + Sync {
    fn invoke(&self, args: &[String], env: &mut dyn EnvStore) -> ShellResult<String>;
}

impl<F> StdFunction for F
where
    F: Fn(&[String], &mut dyn EnvStore) -> ShellResult<String> + Send + Sync,
{
    fn invoke(&self, args: &[String], env: &mut dyn EnvStore) -> ShellResult<String> {
        self(args, env)
    }
}

/// Name to handler registry.
#[derive(Clone)]
pub struct StdLib {
    functions: HashMap<String, Arc<dyn StdFunction>>,
}

impl Default for StdLib {
    fn default() -> Self {
        Self::new()
    }
}

impl StdLib {
    /// Registry with the default function set.
    pub fn new() -> Self {
        let mut lib = Self::empty();
        lib.register_defaults();
        lib
    }

    pub fn empty() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: &str, function: F)
    where
        F: Fn(&[String], &mut dyn EnvStore) -> ShellResult<String> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(function));
    }

    /// Register a handler that implements [`StdFunction`] directly.
    pub fn register_handler(&mut self, name: &str, handler: Arc<dyn StdFunction>) {
        self.functions.insert(name.to_string(), handler);
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.functions.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StdFunction>> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Look up and invoke in one step; `None` when no such function exists.
    pub fn call(
        &self,
        name: &str,
        args: &[String],
        env: &mut dyn EnvStore,
    ) -> Option<ShellResult<String>> {
        self.functions.get(name).map(|f| f.invoke(args, env))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    fn register_defaults(&mut self) {
        // Output
        self.register("Print", |args: &[String], _: &mut dyn EnvStore| Ok(args.join(" ")));
        self.register("Println", |args: &[String], _: &mut dyn EnvStore| {
            Ok(format!("{}\n", args.join(" ")))
        });
        self.register("Error", |args: &[String], _: &mut dyn EnvStore| {
            let text = args.join(" ");
            eprint!("{text}");
            Ok(text)
        });
        self.register("Errorln", |args: &[String], _: &mut dyn EnvStore| {
            let text = args.join(" ");
            eprintln!("{text}");
            Ok(format!("{text}\n"))
        });

        // Files
        self.register("ReadFile", |args: &[String], env: &mut dyn EnvStore| {
            arity("ReadFile", args, 1, "filename")?;
            let path = resolve(env, &args[0]);
            std::fs::read_to_string(&path).map_err(|e| {
                ShellError::from(e).with_context("path", path.display().to_string())
            })
        });
        self.register("WriteFile", |args: &[String], env: &mut dyn EnvStore| {
            arity("WriteFile", args, 2, "filename and content")?;
            let path = resolve(env, &args[0]);
            std::fs::write(&path, args[1..].join(" ")).map_err(|e| {
                ShellError::from(e).with_context("path", path.display().to_string())
            })?;
            Ok("File written".to_string())
        });
        self.register("ListFiles", |args: &[String], env: &mut dyn EnvStore| {
            let dir = match args.first() {
                Some(dir) => resolve(env, dir),
                None => env.working_dir(),
            };
            let mut names = Vec::new();
            for entry in std::fs::read_dir(&dir)? {
                names.push(entry?.file_name().to_string_lossy().into_owned());
            }
            names.sort();
            Ok(names.join("\n"))
        });
        self.register("FileExists", |args: &[String], env: &mut dyn EnvStore| {
            arity("FileExists", args, 1, "filename")?;
            Ok(resolve(env, &args[0]).exists().to_string())
        });

        // Strings
        self.register("Contains", |args: &[String], _: &mut dyn EnvStore| {
            arity("Contains", args, 2, "haystack and needle")?;
            Ok(args[0].contains(args[1].as_str()).to_string())
        });
        self.register("Replace", |args: &[String], _: &mut dyn EnvStore| {
            arity("Replace", args, 3, "string, old and new")?;
            Ok(args[0].replace(args[1].as_str(), &args[2]))
        });
        self.register("ToUpper", |args: &[String], _: &mut dyn EnvStore| {
            arity("ToUpper", args, 1, "string")?;
            Ok(args[0].to_uppercase())
        });
        self.register("ToLower", |args: &[String], _: &mut dyn EnvStore| {
            arity("ToLower", args, 1, "string")?;
            Ok(args[0].to_lowercase())
        });
        self.register("Trim", |args: &[String], _: &mut dyn EnvStore| {
            arity("Trim", args, 1, "string")?;
            Ok(args[0].trim().to_string())
        });

        // Environment
        self.register("GetEnv", |args: &[String], env: &mut dyn EnvStore| {
            arity("GetEnv", args, 1, "variable name")?;
            Ok(env.get_env(&args[0]).unwrap_or_default())
        });
        self.register("SetEnv", |args: &[String], env: &mut dyn EnvStore| {
            arity("SetEnv", args, 2, "key and value")?;
            env.set_env(&args[0], &args[1]);
            Ok("Environment variable set".to_string())
        });
        self.register("WorkingDir", |_: &[String], env: &mut dyn EnvStore| {
            Ok(env.working_dir().display().to_string())
        });
        self.register("ChangeDir", |args: &[String], env: &mut dyn EnvStore| {
            arity("ChangeDir", args, 1, "directory path")?;
            env.set_working_dir(Path::new(&args[0]))?;
            Ok("Directory changed".to_string())
        });
    }
}

fn arity(function: &str, args: &[String], required: usize, what: &str) -> ShellResult<()> {
    if args.len() < required {
        return Err(ShellError::invalid_input(format!("{function} requires {what}"))
            .with_context("function", function));
    }
    Ok(())
}

fn resolve(env: &dyn EnvStore, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        env.working_dir().join(path)
    }
}
