//! Page Registry
//!
//! Maps URL paths to page layouts for multi-page apps. Each app owns one
//! registry, shared by handle between the app and its routing callback.
//!
//! # Registration defaults
//!
//! | field   | when not supplied                                          |
//! |---------|------------------------------------------------------------|
//! | `path`  | from the template (`<var>` becomes `none`), else the module |
//! | `name`  | last module segment, `_` to space, capitalized              |
//! | `title` | the app title, unless that is the default "Dash"            |
//! | `order` | `0` for `/` when no page supplies an order                  |
//!
//! Pages are kept sorted: numeric orders first, then string orders, then
//! unordered pages by module name.
//!
//! # Routing
//!
//! [`PageRegistry::resolve`] strips the request prefix from the pathname,
//! follows redirects, matches path templates segment by segment and hands
//! path variables and query parameters to dynamic layouts. Unknown paths
//! render the `not_found_404` page if one is registered.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::AppConfig;
use crate::error::PageError;

/// Path variables and query parameters passed to a dynamic layout.
pub type PageArgs = IndexMap<String, Value>;

type LayoutFn = dyn Fn(&PageArgs) -> Value + Send + Sync;

/// A page body: fixed, or computed per request.
#[derive(Clone)]
pub enum PageLayout {
    Static(Value),
    Dynamic(Arc<LayoutFn>),
}

impl PageLayout {
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&PageArgs) -> Value + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(f))
    }

    fn render(&self, args: &PageArgs) -> Value {
        match self {
            Self::Static(value) => value.clone(),
            Self::Dynamic(f) => f(args),
        }
    }
}

impl fmt::Debug for PageLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(value) => f.debug_tuple("Static").field(value).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic"),
        }
    }
}

/// Sort key supplied for a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOrder {
    Number(i64),
    Text(String),
}

impl From<i64> for PageOrder {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for PageOrder {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// One registered page.
#[derive(Debug, Clone)]
pub struct Page {
    pub module: String,
    pub path: String,
    pub supplied_path: Option<String>,
    pub path_template: Option<String>,
    pub name: String,
    pub supplied_name: Option<String>,
    pub title: String,
    pub supplied_title: Option<String>,
    pub description: String,
    pub order: Option<PageOrder>,
    pub supplied_order: Option<PageOrder>,
    pub image: Option<String>,
    pub image_url: Option<String>,
    pub redirect_from: Vec<String>,
    pub relative_path: String,
    pub layout: Option<PageLayout>,
    /// Anything else registered with the page.
    pub extra: IndexMap<String, Value>,
}

/// Arguments of [`PageRegistry::register_page`].
#[derive(Debug, Clone, Default)]
pub struct PageOptions {
    module: String,
    path: Option<String>,
    path_template: Option<String>,
    name: Option<String>,
    order: Option<PageOrder>,
    title: Option<String>,
    description: Option<String>,
    image: Option<String>,
    image_url: Option<String>,
    redirect_from: Vec<String>,
    layout: Option<PageLayout>,
    extra: IndexMap<String, Value>,
}

impl PageOptions {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            ..Self::default()
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn path_template(mut self, template: impl Into<String>) -> Self {
        self.path_template = Some(template.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn order(mut self, order: impl Into<PageOrder>) -> Self {
        self.order = Some(order.into());
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn image_url(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    pub fn redirect_from(mut self, path: impl Into<String>) -> Self {
        self.redirect_from.push(path.into());
        self
    }

    pub fn layout(mut self, layout: Value) -> Self {
        self.layout = Some(PageLayout::Static(layout));
        self
    }

    pub fn layout_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&PageArgs) -> Value + Send + Sync + 'static,
    {
        self.layout = Some(PageLayout::dynamic(f));
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Outcome of routing a pathname.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Page {
        /// `None` for the built-in 404 layout.
        module: Option<String>,
        layout: Value,
        title: String,
    },
    Redirect(String),
}

/// Pages of one app, sorted. Clones share the same registry.
#[derive(Debug, Clone)]
pub struct PageRegistry {
    pages: Arc<RwLock<IndexMap<String, Page>>>,
    config: Arc<AppConfig>,
}

impl PageRegistry {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self {
            pages: Arc::new(RwLock::new(IndexMap::new())),
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.pages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.read().is_empty()
    }

    pub fn get(&self, module: &str) -> Option<Page> {
        self.pages.read().get(module).cloned()
    }

    /// Every page, in sort order.
    pub fn pages(&self) -> Vec<Page> {
        self.pages.read().values().cloned().collect()
    }

    /// Adds or replaces the page for `options.module`.
    pub fn register_page(&self, options: PageOptions) -> Result<Page, PageError> {
        let module = options.module;
        if module.trim().is_empty() || module == "__main__" {
            return Err(PageError::InvalidModuleName(module));
        }
        if let Some(template) = &options.path_template {
            validate_template(template)?;
        }

        let path = match &options.path {
            Some(path) => path.clone(),
            None => infer_path(&module, options.path_template.as_deref(), &self.config.pages_folder),
        };
        let name = options.name.clone().unwrap_or_else(|| infer_name(&module));
        let title = match &options.title {
            Some(title) => title.clone(),
            None if self.config.title != "Dash" => self.config.title.clone(),
            None => name.clone(),
        };
        let relative_path = self.relative_path(&path)?;

        let page = Page {
            module: module.clone(),
            supplied_path: options.path,
            path_template: options.path_template,
            supplied_name: options.name,
            name,
            supplied_title: options.title,
            title,
            description: options.description.unwrap_or_default(),
            order: options.order.clone(),
            supplied_order: options.order,
            image: options.image,
            image_url: options.image_url,
            redirect_from: options.redirect_from,
            relative_path,
            layout: options.layout,
            extra: options.extra,
            path,
        };

        let mut pages = self.pages.write();
        pages.insert(module.clone(), page);

        let order_supplied = pages.values().any(|p| p.supplied_order.is_some());
        for page in pages.values_mut() {
            page.order = if page.path == "/" && !order_supplied {
                Some(PageOrder::Number(0))
            } else {
                page.supplied_order.clone()
            };
        }
        pages.sort_by(|_, a, _, b| compare_pages(a, b));

        debug!(module = %module, pages = pages.len(), "registered page");
        pages
            .get(&module)
            .cloned()
            .ok_or(PageError::InvalidModuleName(module))
    }

    /// `path` under the app's request prefix.
    pub fn relative_path(&self, path: &str) -> Result<String, PageError> {
        let prefix = self.config.requests_pathname_prefix.as_str();
        if path.is_empty() {
            return Ok(prefix.to_string());
        }
        if !path.starts_with('/') {
            return Err(PageError::UnsupportedRelativePath(path.to_string()));
        }
        Ok(format!("{}/{}", prefix.trim_end_matches('/'), path.trim_start_matches('/')))
    }

    /// Reverses [`relative_path`](Self::relative_path), without the
    /// surrounding slashes.
    pub fn strip_relative_path(&self, path: &str) -> Result<String, PageError> {
        let prefix = self.config.requests_pathname_prefix.trim_end_matches('/');
        let stripped = if prefix.is_empty() {
            path.strip_prefix('/')
        } else {
            path.strip_prefix(prefix)
        };
        stripped
            .map(|rest| rest.trim_matches('/').to_string())
            .ok_or_else(|| PageError::UnsupportedRelativePath(path.to_string()))
    }

    /// Routes a location to a page layout.
    pub fn resolve(&self, pathname: &str, search: &str) -> Result<Route, PageError> {
        let path_id = self.strip_relative_path(pathname)?;
        let pages = self.pages.read();

        for page in pages.values() {
            if page.redirect_from.iter().any(|from| from.trim_matches('/') == path_id) {
                debug!(from = %pathname, to = %page.relative_path, "page redirect");
                return Ok(Route::Redirect(page.relative_path.clone()));
            }
        }

        let mut args = parse_query_string(search);
        for page in pages.values() {
            let variables = page
                .path_template
                .as_deref()
                .and_then(|template| parse_path_variables(&path_id, template.trim_matches('/')));
            let matched = variables.is_some() || page.path.trim_matches('/') == path_id;
            if !matched {
                continue;
            }
            if let Some(variables) = variables {
                for (key, value) in variables.into_iter().rev() {
                    args.shift_insert(0, key, Value::String(value));
                }
            }
            return Ok(Route::Page {
                module: Some(page.module.clone()),
                layout: page.layout.as_ref().map_or(Value::String(String::new()), |l| l.render(&args)),
                title: page.title.clone(),
            });
        }

        let not_found = pages
            .values()
            .find(|page| page.module.rsplit('.').next() == Some("not_found_404"));
        Ok(match not_found {
            Some(page) => Route::Page {
                module: Some(page.module.clone()),
                layout: page.layout.as_ref().map_or(Value::Null, |l| l.render(&args)),
                title: page.title.clone(),
            },
            None => Route::Page {
                module: None,
                layout: default_not_found_layout(),
                title: self.config.title.clone(),
            },
        })
    }
}

/// `{"type": "H1", "namespace": "dash_html_components", "props": {...}}`.
fn default_not_found_layout() -> Value {
    json!({
        "type": "H1",
        "namespace": "dash_html_components",
        "props": { "children": "404 - Page not found" },
    })
}

fn compare_pages(a: &Page, b: &Page) -> Ordering {
    fn rank(order: &Option<PageOrder>) -> (u8, i64, &str) {
        match order {
            Some(PageOrder::Number(n)) => (0, *n, ""),
            Some(PageOrder::Text(s)) => (1, 0, s.as_str()),
            None => (2, 0, ""),
        }
    }
    rank(&a.order).cmp(&rank(&b.order)).then_with(|| a.module.cmp(&b.module))
}

fn infer_path(module: &str, template: Option<&str>, pages_folder: &str) -> String {
    let path = match template {
        Some(template) => replace_variables(template, "none"),
        None => {
            let folder = pages_folder.trim_matches('/').rsplit('/').next().unwrap_or_default();
            let module = if folder.is_empty() {
                module
            } else {
                module.strip_prefix(&format!("{folder}.")).unwrap_or(module)
            };
            module.replace('_', "-").replace('.', "/").to_lowercase()
        }
    };
    if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    }
}

fn infer_name(module: &str) -> String {
    let last = module.rsplit('.').next().unwrap_or(module).replace('_', " ");
    let mut chars = last.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Replaces every `<variable>` with `with`.
fn replace_variables(template: &str, with: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('<') {
        let Some(len) = rest[start..].find('>') else {
            break;
        };
        out.push_str(&rest[..start]);
        out.push_str(with);
        rest = &rest[start + len + 1..];
    }
    out.push_str(rest);
    out
}

fn variable_name(segment: &str) -> Option<&str> {
    segment.strip_prefix('<').and_then(|s| s.strip_suffix('>'))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c == '_' || c.is_alphabetic()) && chars.all(|c| c == '_' || c.is_alphanumeric())
}

/// Every segment holding a variable must be exactly `<identifier>`.
pub fn validate_template(template: &str) -> Result<(), PageError> {
    for segment in template.split('/') {
        if !segment.contains(['<', '>']) {
            continue;
        }
        if !variable_name(segment).is_some_and(is_identifier) {
            return Err(PageError::InvalidPathTemplate(template.to_string()));
        }
    }
    Ok(())
}

/// Matches `path` against `template` (both without outer slashes). A
/// variable segment matches any non-empty segment.
fn parse_path_variables(path: &str, template: &str) -> Option<IndexMap<String, String>> {
    let path_segments: Vec<&str> = path.split('/').collect();
    let template_segments: Vec<&str> = template.split('/').collect();
    if path_segments.len() != template_segments.len() {
        return None;
    }
    let mut variables = IndexMap::new();
    for (segment, pattern) in path_segments.into_iter().zip(template_segments) {
        match variable_name(pattern) {
            Some(name) if !segment.is_empty() => {
                variables.insert(name.to_string(), percent_decode(segment));
            }
            Some(_) => return None,
            None if segment == pattern => {}
            None => return None,
        }
    }
    Some(variables)
}

/// Query parameters from `?a=1&b=2&b=3`: a repeated key becomes a list.
pub fn parse_query_string(search: &str) -> PageArgs {
    let Some(query) = search.strip_prefix('?') else {
        return PageArgs::new();
    };
    let mut params = PageArgs::new();
    for pair in query.split(['&', ';']).filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if value.is_empty() {
            continue;
        }
        let key = percent_decode(&key.replace('+', " "));
        let value = Value::String(percent_decode(&value.replace('+', " ")));
        match params.get_mut(&key) {
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                params.insert(key, value);
            }
        }
    }
    params
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PageRegistry {
        PageRegistry::new(Arc::new(AppConfig::default()))
    }

    #[test]
    fn defaults_are_inferred() {
        let pages = registry();
        let page = pages.register_page(PageOptions::new("pages.historical_analysis")).unwrap();
        assert_eq!(page.path, "/historical-analysis");
        assert_eq!(page.name, "Historical analysis");
        assert_eq!(page.title, "Historical analysis");
        assert_eq!(page.relative_path, "/historical-analysis");
        assert_eq!(page.description, "");
        assert!(page.supplied_path.is_none());
    }

    #[test]
    fn folder_prefix_is_a_whole_package() {
        let pages = registry();
        let page = pages.register_page(PageOptions::new("pagesextra.x")).unwrap();
        assert_eq!(page.path, "/pagesextra/x");
        let page = pages.register_page(PageOptions::new("pages.sub.deep_page")).unwrap();
        assert_eq!(page.path, "/sub/deep-page");
    }

    #[test]
    fn template_gives_default_path() {
        let pages = registry();
        let page = pages
            .register_page(PageOptions::new("pages.report").path_template("/report/<report_id>"))
            .unwrap();
        assert_eq!(page.path, "/report/none");
    }

    #[test]
    fn app_title_wins_unless_default() {
        let config = AppConfig {
            title: "Analytics".into(),
            ..AppConfig::default()
        };
        let pages = PageRegistry::new(Arc::new(config));
        let page = pages.register_page(PageOptions::new("pages.home")).unwrap();
        assert_eq!(page.title, "Analytics");
        let page = pages.register_page(PageOptions::new("pages.other").title("Other")).unwrap();
        assert_eq!(page.title, "Other");
    }

    #[test]
    fn invalid_templates_and_modules() {
        let pages = registry();
        assert!(matches!(
            pages.register_page(PageOptions::new("pages.a").path_template("/a/<1bad>")),
            Err(PageError::InvalidPathTemplate(_))
        ));
        assert!(matches!(
            pages.register_page(PageOptions::new("pages.a").path_template("/a/x<id>")),
            Err(PageError::InvalidPathTemplate(_))
        ));
        assert!(matches!(
            pages.register_page(PageOptions::new("")),
            Err(PageError::InvalidModuleName(_))
        ));
        assert!(validate_template("/a/<id>/b/<other_id>").is_ok());
    }

    #[test]
    fn home_page_sorts_first_without_orders() {
        let pages = registry();
        pages.register_page(PageOptions::new("pages.zeta")).unwrap();
        pages.register_page(PageOptions::new("pages.alpha")).unwrap();
        pages.register_page(PageOptions::new("pages.home").path("/")).unwrap();
        let modules: Vec<String> = pages.pages().into_iter().map(|p| p.module).collect();
        assert_eq!(modules, vec!["pages.home", "pages.alpha", "pages.zeta"]);
        assert_eq!(pages.get("pages.home").unwrap().order, Some(PageOrder::Number(0)));
    }

    #[test]
    fn supplied_orders_sort_numbers_then_strings() {
        let pages = registry();
        pages.register_page(PageOptions::new("pages.home").path("/")).unwrap();
        pages.register_page(PageOptions::new("pages.b").order("x")).unwrap();
        pages.register_page(PageOptions::new("pages.c").order(2)).unwrap();
        pages.register_page(PageOptions::new("pages.d").order(1)).unwrap();
        let modules: Vec<String> = pages.pages().into_iter().map(|p| p.module).collect();
        assert_eq!(modules, vec!["pages.d", "pages.c", "pages.b", "pages.home"]);
        assert_eq!(pages.get("pages.home").unwrap().order, None);
    }

    #[test]
    fn relative_paths_follow_the_prefix() {
        let config = AppConfig {
            requests_pathname_prefix: "/app/".into(),
            ..AppConfig::default()
        };
        let pages = PageRegistry::new(Arc::new(config));
        assert_eq!(pages.relative_path("/page-1").unwrap(), "/app/page-1");
        assert_eq!(pages.relative_path("").unwrap(), "/app/");
        assert!(pages.relative_path("page-1").is_err());
        assert_eq!(pages.strip_relative_path("/app/page-1/").unwrap(), "page-1");
        assert!(pages.strip_relative_path("/other").is_err());

        let root = registry();
        assert_eq!(root.relative_path("/").unwrap(), "/");
        assert_eq!(root.strip_relative_path("/").unwrap(), "");
    }

    #[test]
    fn query_strings() {
        let params = parse_query_string("?a=1&b=x%20y&b=z&empty=&c=a+b");
        assert_eq!(params["a"], json!("1"));
        assert_eq!(params["b"], json!(["x y", "z"]));
        assert_eq!(params["c"], json!("a b"));
        assert!(!params.contains_key("empty"));
        assert!(parse_query_string("a=1").is_empty());
    }

    #[test]
    fn routes_templates_redirects_and_404() {
        let pages = registry();
        pages
            .register_page(PageOptions::new("pages.home").path("/").layout(json!("home")))
            .unwrap();
        pages
            .register_page(
                PageOptions::new("pages.report")
                    .path_template("/report/<report_id>")
                    .redirect_from("/old-report")
                    .layout_fn(|args| json!({"id": args["report_id"], "tab": args.get("tab")})),
            )
            .unwrap();

        assert_eq!(
            pages.resolve("/", "").unwrap(),
            Route::Page {
                module: Some("pages.home".into()),
                layout: json!("home"),
                title: "Home".into(),
            }
        );
        let Route::Page { layout, .. } = pages.resolve("/report/42", "?tab=summary").unwrap() else {
            panic!("expected a page");
        };
        assert_eq!(layout, json!({"id": "42", "tab": "summary"}));
        assert_eq!(pages.resolve("/old-report", "").unwrap(), Route::Redirect("/report/none".into()));

        let Route::Page { module, layout, .. } = pages.resolve("/missing", "").unwrap() else {
            panic!("expected a page");
        };
        assert_eq!(module, None);
        assert_eq!(layout["props"]["children"], json!("404 - Page not found"));

        pages
            .register_page(PageOptions::new("pages.not_found_404").layout(json!("custom 404")))
            .unwrap();
        let Route::Page { module, layout, .. } = pages.resolve("/missing", "").unwrap() else {
            panic!("expected a page");
        };
        assert_eq!(module.as_deref(), Some("pages.not_found_404"));
        assert_eq!(layout, json!("custom 404"));
    }
}
