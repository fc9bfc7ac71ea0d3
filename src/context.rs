//! Render context: subquery depth and parameter namespacing.

use crate::error::{QueryError, Result};
use crate::schema::Param;
use std::cell::RefCell;
use std::collections::HashSet;

/// Deepest allowed subquery nesting.
pub const MAX_SUBQUERY_DEPTH: usize = 3;

/// De-duplicated parameter names in first-seen order.
#[derive(Debug, Default)]
pub struct ParamSet {
    order: Vec<String>,
    seen: HashSet<String>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, name: String) {
        if self.seen.insert(name.clone()) {
            self.order.push(name);
        }
    }

    pub fn into_names(self) -> Vec<String> {
        self.order
    }
}

/// Per-render state. One root context is created per render call; each
/// subquery gets a child via [`RenderContext::child`] that shares the
/// parameter set.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    depth: usize,
    params: &'a RefCell<ParamSet>,
}

impl<'a> RenderContext<'a> {
    pub fn new(params: &'a RefCell<ParamSet>) -> Self {
        Self { depth: 0, params }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Prefix applied to parameter names bound at this depth.
    pub fn prefix(&self) -> String {
        if self.depth == 0 {
            String::new()
        } else {
            format!("sq{}_", self.depth)
        }
    }

    /// Context for a nested subquery.
    pub fn child(&self) -> Result<RenderContext<'a>> {
        let depth = self.depth + 1;
        if depth > MAX_SUBQUERY_DEPTH {
            return Err(QueryError::DepthExceeded {
                depth,
                max: MAX_SUBQUERY_DEPTH,
            });
        }
        tracing::trace!(depth, "entering subquery");
        Ok(RenderContext {
            depth,
            params: self.params,
        })
    }

    /// Record a parameter and return its namespaced name.
    pub fn bind(&self, param: &Param) -> String {
        let name = format!("{}{}", self.prefix(), param.name());
        tracing::trace!(param = %name, depth = self.depth, "bound parameter");
        self.params.borrow_mut().insert(name.clone());
        name
    }

    /// Record a parameter and return its `:name` placeholder.
    pub fn placeholder(&self, param: &Param) -> String {
        format!(":{}", self.bind(param))
    }
}
