//! File-based routing
//!
//! `routes/blog/index.js` serves `/blog`, `routes/users/[id].js` serves
//! `/users/:id` and `routes/about.md` serves `/about` without a script.
//! Files and directories whose names start with `_` are private.

use crate::dispatch::Route;
use crate::fs::{FsResult, VirtualFs, WalkControl, vpath, walk};
use std::collections::HashMap;

/// Extensions that produce routes; earlier entries win for the same URL
const ROUTE_EXTENSIONS: [&str; 4] = ["js", "html", "md", "txt"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Static(String),
    Param(String),
}

#[derive(Debug, Clone)]
struct Entry {
    route: Route,
    segments: Vec<Segment>,
}

impl Entry {
    fn dynamic_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Param(_)))
            .count()
    }

    fn matches(&self, parts: &[&str]) -> Option<HashMap<String, String>> {
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Static(name) if name == part => {}
                Segment::Static(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), (*part).to_string());
                }
            }
        }
        Some(params)
    }
}

/// A matched route and the parameters bound by its dynamic segments
#[derive(Debug, Clone)]
pub struct RouteMatch<'a> {
    pub route: &'a Route,
    pub params: HashMap<String, String>,
}

/// Routes discovered under a routes directory
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<Entry>,
}

impl RouteTable {
    /// Walk `routes_dir` and collect every route file below it
    pub fn scan(fs: &dyn VirtualFs, routes_dir: &str) -> FsResult<Self> {
        let routes_dir = vpath::clean(routes_dir);
        let mut routes = Vec::new();
        walk(fs, &routes_dir, &mut |path, entry| {
            if entry.name.starts_with('_') {
                return WalkControl::SkipDir;
            }
            if !entry.is_dir {
                if let Some(route) = route_for_file(&routes_dir, path) {
                    routes.push(route);
                }
            }
            WalkControl::Continue
        })?;
        Ok(Self::from_routes(routes))
    }

    /// Build a table from routes; the first route per URL and kind priority is kept
    pub fn from_routes(routes: impl IntoIterator<Item = Route>) -> Self {
        let mut by_url: HashMap<String, Route> = HashMap::new();
        for route in routes {
            match by_url.get(&route.url_path) {
                Some(existing) if priority(existing) <= priority(&route) => {}
                _ => {
                    by_url.insert(route.url_path.clone(), route);
                }
            }
        }

        let mut entries: Vec<Entry> = by_url
            .into_values()
            .map(|route| Entry {
                segments: parse_segments(&route.url_path),
                route,
            })
            .collect();
        entries.sort_by(|a, b| {
            a.dynamic_count()
                .cmp(&b.dynamic_count())
                .then_with(|| b.segments.len().cmp(&a.segments.len()))
                .then_with(|| a.route.url_path.cmp(&b.route.url_path))
        });
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.entries.iter().map(|entry| &entry.route)
    }

    /// Find the route serving `path`, static routes first
    pub fn match_path(&self, path: &str) -> Option<RouteMatch<'_>> {
        let parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
        self.entries.iter().find_map(|entry| {
            entry.matches(&parts).map(|params| RouteMatch {
                route: &entry.route,
                params,
            })
        })
    }
}

fn priority(route: &Route) -> usize {
    ROUTE_EXTENSIONS
        .iter()
        .position(|ext| *ext == route.file_type)
        .unwrap_or(ROUTE_EXTENSIONS.len())
}

fn parse_segments(url_path: &str) -> Vec<Segment> {
    url_path
        .split('/')
        .filter(|part| !part.is_empty())
        .map(|part| match part.strip_prefix(':') {
            Some(name) => Segment::Param(name.to_string()),
            None => Segment::Static(part.to_string()),
        })
        .collect()
}

fn route_for_file(routes_dir: &str, file_path: &str) -> Option<Route> {
    let ext = vpath::extname(file_path).trim_start_matches('.');
    if !ROUTE_EXTENSIONS.contains(&ext) {
        return None;
    }

    let relative = file_path.strip_prefix(routes_dir)?.trim_start_matches('/');
    let stem = &relative[..relative.len() - ext.len() - 1];

    let mut segments = Vec::new();
    let mut param_name = None;
    for part in stem.split('/') {
        match part.strip_prefix('[').and_then(|p| p.strip_suffix(']')) {
            Some(name) if !name.is_empty() => {
                segments.push(format!(":{name}"));
                param_name = Some(name.to_string());
            }
            _ => segments.push(part.to_string()),
        }
    }
    if segments.last().is_some_and(|last| last == "index") {
        segments.pop();
    }

    Some(Route {
        url_path: format!("/{}", segments.join("/")),
        file_path: file_path.to_string(),
        file_type: ext.to_string(),
        is_dynamic: param_name.is_some(),
        param_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;

    fn site() -> MemoryFs {
        MemoryFs::with_files([
            ("/routes/index.js", ""),
            ("/routes/about.md", "# About"),
            ("/routes/blog.js", ""),
            ("/routes/blog.html", ""),
            ("/routes/blog/index.html", ""),
            ("/routes/users/[id].js", ""),
            ("/routes/users/new.js", ""),
            ("/routes/_private/secret.js", ""),
            ("/routes/_helper.js", ""),
            ("/routes/data.json", "{}"),
        ])
    }

    #[test]
    fn test_scan() {
        let table = RouteTable::scan(&site(), "/routes").unwrap();
        let mut urls: Vec<_> = table.routes().map(|r| r.url_path.as_str()).collect();
        urls.sort();
        assert_eq!(urls, ["/", "/about", "/blog", "/users/:id", "/users/new"]);

        let blog = table.match_path("/blog").unwrap();
        assert_eq!(blog.route.file_path, "/routes/blog.js");
        assert!(blog.route.is_script());

        let about = table.match_path("/about/").unwrap();
        assert_eq!(about.route.file_type, "md");
    }

    #[test]
    fn test_static_before_dynamic() {
        let table = RouteTable::scan(&site(), "/routes").unwrap();

        let new = table.match_path("/users/new").unwrap();
        assert_eq!(new.route.file_path, "/routes/users/new.js");
        assert!(new.params.is_empty());

        let user = table.match_path("/users/42").unwrap();
        assert_eq!(user.route.param_name.as_deref(), Some("id"));
        assert_eq!(user.params.get("id").map(String::as_str), Some("42"));

        assert!(table.match_path("/users/42/edit").is_none());
        assert!(table.match_path("/_helper").is_none());
    }

    #[test]
    fn test_index_maps_to_root() {
        let table = RouteTable::scan(&site(), "/routes").unwrap();
        let root = table.match_path("/").unwrap();
        assert_eq!(root.route.file_path, "/routes/index.js");
    }
}
