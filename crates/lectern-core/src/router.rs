// src/router.rs
use crate::http::{Method, Request, Response};
use std::collections::HashMap;

/// Batch request handler invoked by the workers.
///
/// `requests[i]` is answered by filling `responses[i]` in place; a response
/// left untouched goes out as an empty `200 OK`. Request views borrow the
/// connection's receive buffer and must not be retained past return.
pub trait Router: Send + Sync + 'static {
    fn route(&self, requests: &[Request<'_>], responses: &mut [Response]);
}

impl<F> Router for F
where
    F: Fn(&[Request<'_>], &mut [Response]) + Send + Sync + 'static,
{
    fn route(&self, requests: &[Request<'_>], responses: &mut [Response]) {
        self(requests, responses)
    }
}

/// Path captures of a matched route.
#[derive(Debug, Default)]
pub struct Params<'k, 'v> {
    pairs: Vec<(&'k str, &'v str)>,
}

impl<'k, 'v> Params<'k, 'v> {
    pub fn get(&self, name: &str) -> Option<&'v str> {
        self.pairs.iter().find(|(k, _)| *k == name).map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'k str, &'v str)> + '_ {
        self.pairs.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    fn push(&mut self, name: &'k str, value: &'v str) {
        self.pairs.push((name, value));
    }

    fn truncate(&mut self, len: usize) {
        self.pairs.truncate(len);
    }
}

pub type Handler = Box<dyn Fn(&Request<'_>, &Params<'_, '_>, &mut Response) + Send + Sync>;

struct RouteNode {
    segment: String,
    handlers: HashMap<Method, Handler>,
    children: Vec<RouteNode>,
    param_name: Option<String>,
    is_param: bool,
    is_wildcard: bool,
}

impl RouteNode {
    fn new(segment: String) -> Self {
        Self {
            segment,
            handlers: HashMap::new(),
            children: Vec::new(),
            param_name: None,
            is_param: false,
            is_wildcard: false,
        }
    }
}

/// Segment trie keyed by method at the leaves.
///
/// Static segments win over `:param` captures, which win over a trailing
/// `*wildcard`. HEAD falls back to the GET handler; the body is dropped on
/// the wire. Unknown paths get 404, known paths with another method 405.
pub struct Routes {
    root: RouteNode,
}

impl Default for Routes {
    fn default() -> Self {
        Self::new()
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

impl Routes {
    pub fn new() -> Self {
        Self {
            root: RouteNode::new(String::new()),
        }
    }

    pub fn add<H>(&mut self, method: Method, path: &str, handler: H) -> &mut Self
    where
        H: Fn(&Request<'_>, &Params<'_, '_>, &mut Response) + Send + Sync + 'static,
    {
        let mut current = &mut self.root;

        for segment in segments(path) {
            let is_param = segment.starts_with(':');
            let is_wildcard = segment.starts_with('*');
            let (segment_path, param_name) = if is_param || is_wildcard {
                (String::new(), Some(segment[1..].to_string()))
            } else {
                (segment.to_string(), None)
            };

            let found = current.children.iter().position(|child| {
                child.is_param == is_param
                    && child.is_wildcard == is_wildcard
                    && (is_param || is_wildcard || child.segment == segment_path)
            });

            let idx = match found {
                Some(idx) => idx,
                None => {
                    let mut node = RouteNode::new(segment_path);
                    node.is_param = is_param;
                    node.is_wildcard = is_wildcard;
                    node.param_name = param_name;
                    current.children.push(node);
                    current.children.len() - 1
                }
            };
            current = &mut current.children[idx];
        }

        current.handlers.insert(method, Box::new(handler));
        self
    }

    pub fn get<H>(&mut self, path: &str, handler: H) -> &mut Self
    where
        H: Fn(&Request<'_>, &Params<'_, '_>, &mut Response) + Send + Sync + 'static,
    {
        self.add(Method::Get, path, handler)
    }

    pub fn post<H>(&mut self, path: &str, handler: H) -> &mut Self
    where
        H: Fn(&Request<'_>, &Params<'_, '_>, &mut Response) + Send + Sync + 'static,
    {
        self.add(Method::Post, path, handler)
    }

    pub fn head<H>(&mut self, path: &str, handler: H) -> &mut Self
    where
        H: Fn(&Request<'_>, &Params<'_, '_>, &mut Response) + Send + Sync + 'static,
    {
        self.add(Method::Head, path, handler)
    }

    fn find<'r, 'p>(
        &'r self,
        path: &'p str,
        params: &mut Params<'r, 'p>,
    ) -> Option<&'r RouteNode> {
        let segs: Vec<&'p str> = segments(path).collect();
        Self::find_in(&self.root, path, &segs, 0, params)
    }

    fn find_in<'r, 'p>(
        node: &'r RouteNode,
        path: &'p str,
        segs: &[&'p str],
        depth: usize,
        params: &mut Params<'r, 'p>,
    ) -> Option<&'r RouteNode> {
        if depth == segs.len() {
            return (!node.handlers.is_empty()).then_some(node);
        }
        let segment = segs[depth];

        for child in &node.children {
            if !child.is_param && !child.is_wildcard && child.segment == segment {
                if let Some(found) = Self::find_in(child, path, segs, depth + 1, params) {
                    return Some(found);
                }
            }
        }

        for child in node.children.iter().filter(|c| c.is_param) {
            let mark = params.pairs.len();
            if let Some(name) = child.param_name.as_deref() {
                params.push(name, segment);
            }
            if let Some(found) = Self::find_in(child, path, segs, depth + 1, params) {
                return Some(found);
            }
            params.truncate(mark);
        }

        if let Some(child) = node.children.iter().find(|c| c.is_wildcard) {
            if let Some(name) = child.param_name.as_deref() {
                // Offset of this segment inside `path`.
                let start = segment.as_ptr() as usize - path.as_ptr() as usize;
                params.push(name, path[start..].trim_end_matches('/'));
            }
            return (!child.handlers.is_empty()).then_some(child);
        }

        None
    }

    /// Dispatch a single request.
    pub fn dispatch(&self, req: &Request<'_>, res: &mut Response) {
        let path = req.path();
        let mut params = Params::default();
        let Some(node) = self.find(path, &mut params) else {
            res.set_status(404).text("Not Found");
            return;
        };

        let handler = node.handlers.get(&req.method()).or_else(|| {
            (req.method() == Method::Head)
                .then(|| node.handlers.get(&Method::Get))
                .flatten()
        });
        match handler {
            Some(handler) => handler(req, &params, res),
            None => {
                res.set_status(405).text("Method Not Allowed");
            }
        }
    }
}

impl Router for Routes {
    fn route(&self, requests: &[Request<'_>], responses: &mut [Response]) {
        for (req, res) in requests.iter().zip(responses.iter_mut()) {
            self.dispatch(req, res);
        }
    }
}
