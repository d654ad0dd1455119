//! Cache key derivation.
//!
//! Keys look like `p-<path>[-q-<query>...][-c-<name>=<value>...]`. Every
//! variable segment is escaped so that it never contains `-`, `=` or `%`
//! unescaped; the axis tags therefore cannot be forged by request data.

use super::{
    config::{CacheConfig, VaryByQuery},
    request::CacheRequest,
};

const PATH_PREFIX: &str = "p-";
const QUERY_TAG: &str = "-q-";
const COOKIE_TAG: &str = "-c-";

/// Builds cache keys from the configured variation axes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    vary_by_query: VaryByQuery,
    vary_by_cookies: Vec<String>,
    case_sensitive: bool,
}

impl KeyBuilder {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            vary_by_query: config.vary_by_query.clone(),
            vary_by_cookies: config.vary_by_cookies.clone(),
            case_sensitive: config.case_sensitive,
        }
    }

    pub fn build(&self, request: &CacheRequest) -> String {
        let mut key = String::with_capacity(PATH_PREFIX.len() + request.path().len() + 16);
        key.push_str(PATH_PREFIX);

        if self.case_sensitive {
            push_escaped(&mut key, request.path());
        } else {
            push_escaped(&mut key, &request.path().to_lowercase());
        }

        match &self.vary_by_query {
            VaryByQuery::Disabled => {}
            VaryByQuery::All => {
                if let Some(raw) = request.raw_query() {
                    key.push_str(QUERY_TAG);
                    push_escaped(&mut key, raw);
                }
            }
            VaryByQuery::Names(names) => {
                for name in names {
                    if let Some(value) = request.query_param(name) {
                        push_pair(&mut key, QUERY_TAG, name, value);
                    }
                }
            }
        }

        for name in &self.vary_by_cookies {
            if let Some(value) = request.cookie(name) {
                push_pair(&mut key, COOKIE_TAG, name, value);
            }
        }

        key
    }
}

fn push_pair(key: &mut String, tag: &str, name: &str, value: &str) {
    key.push_str(tag);
    push_escaped(key, name);
    key.push('=');
    push_escaped(key, value);
}

fn push_escaped(key: &mut String, segment: &str) {
    for c in segment.chars() {
        match c {
            '%' => key.push_str("%25"),
            '-' => key.push_str("%2D"),
            '=' => key.push_str("%3D"),
            c => key.push(c),
        }
    }
}
