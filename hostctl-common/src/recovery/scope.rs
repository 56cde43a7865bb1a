//! Test scopes and the stack that opens and closes them.

use super::{DrainReport, RecoveryRegistry, Restorer};
use crate::errors::RecoveryError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

/// Teardown nesting level. Ordered innermost first:
/// `Function < Class < Module < Session`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Function,
    Class,
    Module,
    Session,
}

impl Scope {
    pub const ALL: [Scope; 4] = [Scope::Function, Scope::Class, Scope::Module, Scope::Session];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Module => "module",
            Self::Session => "session",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type EnterHook = Box<dyn Fn(Scope) + Send + Sync>;
type ExitHook = Box<dyn Fn(Scope, &Result<DrainReport, RecoveryError>) + Send + Sync>;

/// Explicit stack of open scopes.
///
/// Scopes must be entered outermost first and exited innermost first.
/// Exiting a scope closes it on the registry: its entries are restored and
/// its list cleared.
pub struct ScopeStack {
    registry: Arc<RecoveryRegistry>,
    open: Vec<Scope>,
    on_enter: Vec<EnterHook>,
    on_exit: Vec<ExitHook>,
}

impl ScopeStack {
    pub fn new(registry: Arc<RecoveryRegistry>) -> Self {
        Self {
            registry,
            open: Vec::new(),
            on_enter: Vec::new(),
            on_exit: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Arc<RecoveryRegistry> {
        &self.registry
    }

    /// Innermost open scope.
    pub fn current(&self) -> Option<Scope> {
        self.open.last().copied()
    }

    pub fn depth(&self) -> usize {
        self.open.len()
    }

    /// Run `hook` after every successful `enter`.
    pub fn on_enter(&mut self, hook: impl Fn(Scope) + Send + Sync + 'static) {
        self.on_enter.push(Box::new(hook));
    }

    /// Run `hook` after every `exit`, with the drain result.
    pub fn on_exit(&mut self, hook: impl Fn(Scope, &Result<DrainReport, RecoveryError>) + Send + Sync + 'static) {
        self.on_exit.push(Box::new(hook));
    }

    /// Open `scope`. It must be strictly inside the current innermost scope.
    pub fn enter(&mut self, scope: Scope) -> Result<(), RecoveryError> {
        if let Some(open) = self.current()
            && scope >= open
        {
            return Err(RecoveryError::ScopeOrder { open, entering: scope });
        }
        self.open.push(scope);
        debug!(%scope, depth = self.open.len(), "scope entered");
        for hook in &self.on_enter {
            hook(scope);
        }
        Ok(())
    }

    /// Close the innermost scope, which must be `scope`.
    pub async fn exit(&mut self, scope: Scope, restorer: &mut dyn Restorer) -> Result<DrainReport, RecoveryError> {
        let innermost = self.current();
        if innermost != Some(scope) {
            return Err(RecoveryError::ScopeNotOpen { scope, innermost });
        }
        self.open.pop();

        let result = self.registry.close(scope, restorer).await;
        if let Err(e) = &result {
            error!(%scope, error = %e, "scope teardown incomplete");
        }
        for hook in &self.on_exit {
            hook(scope, &result);
        }
        result
    }

    /// Close every open scope, innermost first. All scopes are closed even
    /// when some fail.
    pub async fn close_all(&mut self, restorer: &mut dyn Restorer) -> Result<Vec<DrainReport>, RecoveryError> {
        let mut reports = Vec::new();
        let mut errors = Vec::new();
        while let Some(scope) = self.current() {
            match self.exit(scope, restorer).await {
                Ok(report) => reports.push(report),
                Err(e) => errors.push(e),
            }
        }
        match errors.len() {
            0 => Ok(reports),
            1 => Err(errors.remove(0)),
            _ => Err(RecoveryError::Multiple(errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::RecoveryEntry;
    use crate::recovery::tests::RecordingRestorer;
    use std::sync::Mutex;

    #[test]
    fn test_scope_order() {
        assert!(Scope::Function < Scope::Class);
        assert!(Scope::Module < Scope::Session);
        assert_eq!(Scope::Class.to_string(), "class");
    }

    #[test]
    fn test_enter_enforces_nesting() {
        let mut stack = ScopeStack::new(Arc::new(RecoveryRegistry::new()));
        stack.enter(Scope::Session).unwrap();
        stack.enter(Scope::Function).unwrap();
        let err = stack.enter(Scope::Class).unwrap_err();
        assert!(matches!(
            err,
            RecoveryError::ScopeOrder {
                open: Scope::Function,
                entering: Scope::Class
            }
        ));
    }

    #[tokio::test]
    async fn test_exit_must_be_innermost() {
        let mut stack = ScopeStack::new(Arc::new(RecoveryRegistry::new()));
        let mut restorer = RecordingRestorer::default();
        stack.enter(Scope::Module).unwrap();
        stack.enter(Scope::Function).unwrap();
        let err = stack.exit(Scope::Module, &mut restorer).await.unwrap_err();
        assert!(matches!(err, RecoveryError::ScopeNotOpen { .. }));
        assert_eq!(stack.depth(), 2);
    }

    #[tokio::test]
    async fn test_close_all_drains_innermost_first() {
        let registry = Arc::new(RecoveryRegistry::new());
        let mut stack = ScopeStack::new(registry.clone());
        let exits = Arc::new(Mutex::new(Vec::new()));
        let seen = exits.clone();
        stack.on_exit(move |scope, _| seen.lock().unwrap().push(scope));

        stack.enter(Scope::Module).unwrap();
        stack.enter(Scope::Class).unwrap();
        stack.enter(Scope::Function).unwrap();
        registry.add_host("compute-0", Scope::Module);
        registry.add_host("compute-1", Scope::Function);

        let mut restorer = RecordingRestorer::default();
        let reports = stack.close_all(&mut restorer).await.unwrap();

        assert_eq!(reports.len(), 3);
        assert_eq!(*exits.lock().unwrap(), vec![Scope::Function, Scope::Class, Scope::Module]);
        assert_eq!(
            restorer.calls,
            vec![RecoveryEntry::host("compute-1"), RecoveryEntry::host("compute-0")]
        );
        assert_eq!(stack.current(), None);
    }

    #[tokio::test]
    async fn test_close_all_aggregates_failures_across_scopes() {
        let registry = Arc::new(RecoveryRegistry::new());
        let mut stack = ScopeStack::new(registry.clone());
        stack.enter(Scope::Class).unwrap();
        stack.enter(Scope::Function).unwrap();
        registry.add_host("a", Scope::Function);
        registry.add_host("b", Scope::Class);

        let mut restorer = RecordingRestorer::default();
        restorer.failing.insert(RecoveryEntry::host("a"));
        restorer.failing.insert(RecoveryEntry::host("b"));

        let err = stack.close_all(&mut restorer).await.unwrap_err();
        assert!(matches!(err, RecoveryError::Multiple(ref errors) if errors.len() == 2));
        assert_eq!(err.failures().len(), 2);
        assert!(registry.is_empty(Scope::Function) && registry.is_empty(Scope::Class));
    }

    #[test]
    fn test_enter_hook_runs() {
        let mut stack = ScopeStack::new(Arc::new(RecoveryRegistry::new()));
        let entered = Arc::new(Mutex::new(Vec::new()));
        let seen = entered.clone();
        stack.on_enter(move |scope| seen.lock().unwrap().push(scope));
        stack.enter(Scope::Session).unwrap();
        assert_eq!(*entered.lock().unwrap(), vec![Scope::Session]);
    }
}
