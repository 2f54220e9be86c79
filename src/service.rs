//! Service definitions: named method tables with typed async adapters.
//!
//! Each method is registered explicitly and the `(args) -> Result<reply,
//! error>` shape is enforced by the type system. The adapter stored per
//! method decodes the request body with the connection's negotiated codec,
//! runs the user future, and encodes the reply; any failure along the way
//! becomes the response header's error string.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::codec::CodecType;

/// Adapter output: encoded reply bytes, or the error string for the header.
type MethodResult = std::result::Result<Bytes, String>;

type AdapterFn = Box<dyn Fn(CodecType, Bytes) -> BoxFuture<'static, MethodResult> + Send + Sync>;

/// One registered method: its adapter plus an invocation counter.
pub struct Method {
    adapter: AdapterFn,
    num_calls: AtomicU64,
}

impl Method {
    /// Number of times this method has been invoked.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::SeqCst)
    }

    /// Counts the invocation and returns the dispatch future.
    pub(crate) fn invoke(&self, codec: CodecType, args: Bytes) -> BoxFuture<'static, MethodResult> {
        self.num_calls.fetch_add(1, Ordering::SeqCst);
        (self.adapter)(codec, args)
    }
}

/// A named collection of methods, registered with a [`Server`].
///
/// Handlers that need state capture it in their closure:
///
/// ```rust,ignore
/// let counter = Arc::new(AtomicU64::new(0));
/// let service = Service::new("Foo").method("Sum", {
///     let counter = counter.clone();
///     move |args: SumArgs| {
///         let counter = counter.clone();
///         async move {
///             counter.fetch_add(1, Ordering::SeqCst);
///             Ok::<_, Infallible>(args.a + args.b)
///         }
///     }
/// });
/// ```
///
/// [`Server`]: crate::server::Server
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<Method>>,
}

impl Service {
    /// Creates an empty service.
    ///
    /// # Panics
    ///
    /// Panics when the name is not an exported-style identifier (leading
    /// ASCII uppercase, then alphanumerics or underscores). A bad service
    /// name is a programming error caught at registration time.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        if !is_exported_name(&name) {
            panic!("{name:?} is not a valid service name");
        }
        Self {
            name,
            methods: HashMap::new(),
        }
    }

    /// Registers a method under this service.
    ///
    /// The handler takes the decoded argument value and resolves to
    /// `Result<reply, error>`; the error's `Display` text travels to the
    /// caller in the response header.
    ///
    /// # Panics
    ///
    /// Panics on a non-exported-style method name or a duplicate
    /// registration, both programming errors caught at registration time.
    pub fn method<A, R, E, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        let name = name.into();
        if !is_exported_name(&name) {
            panic!("{name:?} is not a valid method name");
        }

        let f = Arc::new(f);
        let adapter: AdapterFn = Box::new(move |codec, args| {
            let f = f.clone();
            Box::pin(async move {
                let argv: A = codec.decode(&args).map_err(|e| e.to_string())?;
                let reply = f(argv).await.map_err(|e| e.to_string())?;
                codec.encode(&reply).map_err(|e| e.to_string())
            })
        });

        let method = Method {
            adapter,
            num_calls: AtomicU64::new(0),
        };
        if self
            .methods
            .insert(name.clone(), Arc::new(method))
            .is_some()
        {
            panic!("method {name:?} already defined on service {:?}", self.name);
        }
        debug!(service = %self.name, method = %name, "register method");
        self
    }

    /// The service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up a method by name.
    pub fn get_method(&self, name: &str) -> Option<Arc<Method>> {
        self.methods.get(name).cloned()
    }

    /// Invocation count for a method, if it exists.
    pub fn num_calls(&self, method: &str) -> Option<u64> {
        self.methods.get(method).map(|m| m.num_calls())
    }
}

/// Exported-style identifier: leading ASCII uppercase, then alphanumerics
/// or underscores.
fn is_exported_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
