//! Observer - コンポーネントごとのログ文脈
//!
//! グローバルなロガー設定に依存せず、各コンポーネントは構築時に `Observer` を受け取る。
//! 中身は `tracing::Span` で、`agent` と `component` をフィールドとして持つ。
//! subscriber の設定はバイナリ側（CLI）の責務。

use tracing::Span;

#[derive(Debug, Clone)]
pub struct Observer {
    span: Span,
}

impl Observer {
    pub fn new(agent: &str, component: &'static str) -> Self {
        Self {
            span: tracing::info_span!("stationlink", agent = %agent, component = component),
        }
    }

    /// Observer that records nothing.
    pub fn disabled() -> Self {
        Self {
            span: Span::none(),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Child observer for a sub-component, nested under this span.
    pub fn child(&self, component: &'static str) -> Self {
        Self {
            span: tracing::info_span!(parent: &self.span, "component", component = component),
        }
    }

    /// Run `f` inside the span.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        self.span.in_scope(f)
    }
}

impl Default for Observer {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_observer_runs_closures() {
        let obs = Observer::disabled();
        assert_eq!(obs.in_scope(|| 41 + 1), 42);
        assert!(obs.span().is_none());
    }

    #[test]
    fn child_observer_is_independent_handle() {
        let obs = Observer::new("crane-1", "dispatcher");
        let child = obs.child("sessions");
        assert_eq!(child.in_scope(|| "ok"), "ok");
    }
}
