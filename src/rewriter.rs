//! Safety rewriter: instruments every function-like body in the formatted
//! unit with a stack-guard call.
//!
//! The guard runs as the first statement of free functions, impl and trait
//! methods, nested/local functions and closures, so recursion hiding
//! anywhere in the submission trips a catchable panic instead of the native
//! guard page. Expression-bodied closures are rewritten into block form
//! first. The `__judge` runtime module is the one region left alone: the
//! guard must not instrument itself.

use syn::visit_mut::{self, VisitMut};

/// Parses the formatted unit, injects guards, and prints the instrumented
/// source back out.
pub fn rewrite_unit(source: &str) -> Result<String, syn::Error> {
    let mut file = syn::parse_file(source)?;
    let mut injector = GuardInjector;
    injector.visit_file_mut(&mut file);
    Ok(prettyplease::unparse(&file))
}

fn guard_stmt() -> syn::Stmt {
    syn::parse_quote! { crate::__judge::stack_guard(); }
}

struct GuardInjector;

impl VisitMut for GuardInjector {
    fn visit_item_mod_mut(&mut self, node: &mut syn::ItemMod) {
        if node.ident == "__judge" {
            return;
        }
        visit_mut::visit_item_mod_mut(self, node);
    }

    fn visit_item_fn_mut(&mut self, node: &mut syn::ItemFn) {
        visit_mut::visit_item_fn_mut(self, node);
        node.block.stmts.insert(0, guard_stmt());
    }

    fn visit_impl_item_fn_mut(&mut self, node: &mut syn::ImplItemFn) {
        visit_mut::visit_impl_item_fn_mut(self, node);
        node.block.stmts.insert(0, guard_stmt());
    }

    fn visit_trait_item_fn_mut(&mut self, node: &mut syn::TraitItemFn) {
        visit_mut::visit_trait_item_fn_mut(self, node);
        if let Some(block) = node.default.as_mut() {
            block.stmts.insert(0, guard_stmt());
        }
    }

    fn visit_expr_closure_mut(&mut self, node: &mut syn::ExprClosure) {
        visit_mut::visit_expr_closure_mut(self, node);
        match node.body.as_mut() {
            syn::Expr::Block(block) => {
                block.block.stmts.insert(0, guard_stmt());
            }
            body => {
                // Block form first, then the guard; the original expression
                // becomes the block result.
                let original = body.clone();
                *body = syn::parse_quote!({
                    crate::__judge::stack_guard();
                    #original
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quote::ToTokens;

    fn rewritten(source: &str) -> syn::File {
        syn::parse_file(&rewrite_unit(source).unwrap()).unwrap()
    }

    fn first_stmt_is_guard(block: &syn::Block) -> bool {
        block
            .stmts
            .first()
            .map(|s| s.to_token_stream().to_string().contains("stack_guard"))
            .unwrap_or(false)
    }

    #[test]
    fn instruments_free_functions() {
        let file = rewritten("fn f() { let x = 1; }");
        let syn::Item::Fn(f) = &file.items[0] else { panic!() };
        assert!(first_stmt_is_guard(&f.block));
        assert_eq!(f.block.stmts.len(), 2);
    }

    #[test]
    fn instruments_nested_functions() {
        let file = rewritten("fn outer() { fn inner() { 1; } inner(); }");
        let syn::Item::Fn(outer) = &file.items[0] else { panic!() };
        assert!(first_stmt_is_guard(&outer.block));
        let inner = outer
            .block
            .stmts
            .iter()
            .find_map(|s| match s {
                syn::Stmt::Item(syn::Item::Fn(f)) => Some(f),
                _ => None,
            })
            .expect("nested fn survives");
        assert!(first_stmt_is_guard(&inner.block));
    }

    #[test]
    fn instruments_impl_and_trait_methods() {
        let file = rewritten(
            "struct S; impl S { fn m(&self) {} } trait T { fn d(&self) { } fn sigless(&self); }",
        );
        let syn::Item::Impl(imp) = &file.items[1] else { panic!() };
        let syn::ImplItem::Fn(m) = &imp.items[0] else { panic!() };
        assert!(first_stmt_is_guard(&m.block));
        let syn::Item::Trait(tr) = &file.items[2] else { panic!() };
        let syn::TraitItem::Fn(d) = &tr.items[0] else { panic!() };
        assert!(first_stmt_is_guard(d.default.as_ref().unwrap()));
        let syn::TraitItem::Fn(sigless) = &tr.items[1] else { panic!() };
        assert!(sigless.default.is_none());
    }

    #[test]
    fn rewrites_expression_closures_into_block_form() {
        let file = rewritten("fn f() { let g = |x: i64| x + 1; g(1); }");
        let text = prettyplease::unparse(&file);
        // Closure body became a block: guard first, original expression as
        // the result.
        let closure_at = text.find("|x: i64|").unwrap();
        let after = &text[closure_at..];
        assert!(after.contains("stack_guard"));
        assert!(after.contains("x + 1"));
    }

    #[test]
    fn instruments_block_closures_and_inner_closures() {
        let file = rewritten("fn f() { let g = |x: i64| { let h = |y: i64| y; h(x) }; }");
        let text = prettyplease::unparse(&file);
        assert_eq!(text.matches("stack_guard").count(), 3);
    }

    #[test]
    fn skips_judge_runtime_module() {
        let file = rewritten(
            "mod __judge { pub fn stack_guard() { let probe = 0u8; } } fn f() {}",
        );
        let syn::Item::Mod(m) = &file.items[0] else { panic!() };
        let items = &m.content.as_ref().unwrap().1;
        let syn::Item::Fn(guard) = &items[0] else { panic!() };
        assert_eq!(guard.block.stmts.len(), 1, "guard must not instrument itself");
    }

    #[test]
    fn parse_error_is_reported() {
        assert!(rewrite_unit("fn broken(").is_err());
    }
}
