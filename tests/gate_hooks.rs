//! Gate ordering, observed through the test-hooks call counters.
//!
//! Kept in its own test binary: the counters are process-wide.

#![cfg(feature = "test-hooks")]

use stencil_core::sandbox::{get_check_call_count, reset_check_call_count};
use stencil_core::unit::{get_produce_call_count, reset_produce_call_count};
use stencil_core::{Chunk, Context, Policy, RenderUnit, Renderer, SourceUnit, UnitRegistry, UsageRecord};

#[test]
fn invariant_produce_never_called_after_failed_check() {
    reset_check_call_count();
    reset_produce_call_count();

    let renderer = Renderer::new(UnitRegistry::new());
    let denied = RenderUnit::new(
        SourceUnit::new("exec_page", ""),
        vec![UsageRecord::function("exec", 3)],
        vec![Chunk::Text("<p>never</p>".to_string())],
    );
    assert!(renderer.render(&denied, &Context::new(), &Policy::new()).is_err());
    assert_eq!(get_check_call_count(), 1);
    assert_eq!(get_produce_call_count(), 0);

    let allowed = RenderUnit::literal("frag", "<div>X</div>");
    assert!(renderer.render(&allowed, &Context::new(), &Policy::new()).is_ok());
    assert_eq!(get_check_call_count(), 2);
    assert_eq!(get_produce_call_count(), 1);
}
