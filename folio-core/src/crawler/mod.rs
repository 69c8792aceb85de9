/*!
Rate-limited recursive workspace crawler.

A crawl starts from a paginated search, then expands every discovered page,
database and block with children until the whole reachable tree is loaded.
Sibling branches are expanded concurrently; each branch is depth-first, and
children keep the order the API returned them in. Every outbound call goes
through one [`RateLimitedQueue`] per crawl and gets the bounded retry.

A failure below some item is recorded against that item and the crawl moves
on, so the result is always a best-effort tree plus a list of what is missing.
*/

mod notion;
mod queue;

pub use notion::NotionApi;
pub use queue::RateLimitedQueue;

use async_trait::async_trait;
use folio_retry::{retry_transient, RetryPolicy};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CrawlerConfig;
use crate::model::{ItemKind, WorkspaceItem};
use crate::{FolioError, Result};

/// Item id used for failures of the top-level search itself
pub const ROOT_SCOPE: &str = "workspace";

/// One page of results from a paginated API call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApiPage {
    pub results: Vec<Value>,
    /// Continuation cursor; `None` once the listing is exhausted
    pub next_cursor: Option<String>,
}

/// The external workspace API, one paginated call at a time
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkspaceApi: Send + Sync {
    /// Top-level discovery of everything the token can see
    async fn search(&self, cursor: Option<String>) -> Result<ApiPage>;

    /// Block children of a page or block
    async fn list_children(&self, block_id: String, cursor: Option<String>) -> Result<ApiPage>;

    /// Rows of a database
    async fn query_database(&self, database_id: String, cursor: Option<String>) -> Result<ApiPage>;
}

/// A subtree that could not be fully loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialFailure {
    pub item_id: String,
    pub message: String,
}

impl PartialFailure {
    pub fn new(item_id: impl Into<String>, error: &FolioError) -> Self {
        Self {
            item_id: item_id.into(),
            message: error.to_string(),
        }
    }
}

/// Result of one crawl
#[derive(Debug, Clone, Default)]
pub struct CrawlOutcome {
    /// Top-level items with their children populated
    pub items: Vec<WorkspaceItem>,
    pub failures: Vec<PartialFailure>,
    /// Outbound API calls admitted by the rate queue
    pub requests: u64,
    /// True when the deadline cut the crawl short
    pub deadline_hit: bool,
}

impl CrawlOutcome {
    /// Number of items in the whole tree
    pub fn item_count(&self) -> usize {
        self.items.iter().map(WorkspaceItem::subtree_len).sum()
    }

    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Crawls a workspace through a [`WorkspaceApi`]
pub struct Crawler {
    api: Arc<dyn WorkspaceApi>,
    config: CrawlerConfig,
    retry_policy: RetryPolicy,
}

impl Crawler {
    pub fn new(api: Arc<dyn WorkspaceApi>, config: CrawlerConfig) -> Self {
        Self {
            api,
            config,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Crawl the whole workspace without a deadline
    pub async fn crawl(&self) -> CrawlOutcome {
        self.run(RateLimitedQueue::from_config(&self.config)).await
    }

    /// Crawl until `deadline`, returning whatever was gathered by then
    pub async fn crawl_until(&self, deadline: Instant) -> CrawlOutcome {
        self.run(RateLimitedQueue::from_config(&self.config).with_deadline(deadline))
            .await
    }

    async fn run(&self, queue: RateLimitedQueue) -> CrawlOutcome {
        let run = CrawlRun {
            api: self.api.as_ref(),
            queue,
            retry_policy: &self.retry_policy,
            deadline_hit: AtomicBool::new(false),
        };

        let mut failures = Vec::new();
        let top_level = run.discover(&mut failures).await;
        debug!(top_level = top_level.len(), "search complete");

        let expanded = join_all(top_level.into_iter().map(|item| run.expand(item))).await;
        let mut items = Vec::with_capacity(expanded.len());
        for (item, branch_failures) in expanded {
            items.push(item);
            failures.extend(branch_failures);
        }

        let outcome = CrawlOutcome {
            items,
            failures,
            requests: run.queue.admitted(),
            deadline_hit: run.deadline_hit.load(Ordering::Relaxed),
        };
        info!(
            items = outcome.item_count(),
            failures = outcome.failures.len(),
            requests = outcome.requests,
            deadline_hit = outcome.deadline_hit,
            "crawl finished"
        );
        outcome
    }
}

/// Per-invocation crawl state
struct CrawlRun<'c> {
    api: &'c dyn WorkspaceApi,
    queue: RateLimitedQueue,
    retry_policy: &'c RetryPolicy,
    deadline_hit: AtomicBool,
}

impl<'c> CrawlRun<'c> {
    /// One rate-limited, retried API call
    async fn request<'a, F>(&'a self, operation: &'static str, mut call: F) -> Result<ApiPage>
    where
        F: FnMut() -> BoxFuture<'a, Result<ApiPage>>,
    {
        retry_transient(operation, self.retry_policy, |_| self.queue.run(call())).await
    }

    fn failure(&self, item_id: &str, error: &FolioError) -> PartialFailure {
        if matches!(error, FolioError::DeadlineExceeded(_)) {
            self.deadline_hit.store(true, Ordering::Relaxed);
        }
        warn!(item_id, error = %error, "subtree not fully crawled");
        PartialFailure::new(item_id, error)
    }

    async fn discover(&self, failures: &mut Vec<PartialFailure>) -> Vec<WorkspaceItem> {
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = match self.request("search", || self.api.search(cursor.clone())).await {
                Ok(page) => page,
                Err(e) => {
                    failures.push(self.failure(ROOT_SCOPE, &e));
                    break;
                }
            };

            for raw in page.results {
                match WorkspaceItem::from_api_object(raw) {
                    Ok(item) if seen.insert(item.id.clone()) => items.push(item),
                    Ok(item) => debug!(item_id = %item.id, "duplicate search result dropped"),
                    Err(e) => failures.push(self.failure(ROOT_SCOPE, &e)),
                }
            }

            match page.next_cursor {
                Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                    let e = FolioError::invalid_format("search returned the same cursor twice");
                    failures.push(self.failure(ROOT_SCOPE, &e));
                    break;
                }
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        items
    }

    /// All children of `item`, across every page of the listing
    async fn fetch_children(&self, item: &WorkspaceItem) -> Result<Vec<Value>> {
        let mut results = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = match item.kind {
                ItemKind::Database => {
                    self.request("query_database", || {
                        self.api.query_database(item.id.clone(), cursor.clone())
                    })
                    .await?
                }
                ItemKind::Page | ItemKind::Block => {
                    self.request("list_children", || {
                        self.api.list_children(item.id.clone(), cursor.clone())
                    })
                    .await?
                }
            };
            results.extend(page.results);

            match page.next_cursor {
                Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                    return Err(FolioError::invalid_format(format!(
                        "children listing of {} returned the same cursor twice",
                        item.id
                    )));
                }
                Some(next) => cursor = Some(next),
                None => return Ok(results),
            }
        }
    }

    /// Load the subtree below `item`, returning it with the failures met on the way
    fn expand(&self, mut item: WorkspaceItem) -> BoxFuture<'_, (WorkspaceItem, Vec<PartialFailure>)> {
        async move {
            let mut failures = Vec::new();
            let expandable = match item.kind {
                ItemKind::Page | ItemKind::Database => true,
                ItemKind::Block => item.has_children,
            };
            if !expandable {
                return (item, failures);
            }

            let raw_children = match self.fetch_children(&item).await {
                Ok(children) => children,
                Err(e) => {
                    failures.push(self.failure(&item.id, &e));
                    return (item, failures);
                }
            };

            let mut children = Vec::with_capacity(raw_children.len());
            for raw in raw_children {
                match WorkspaceItem::from_api_object(raw) {
                    Ok(child) => children.push(child),
                    Err(e) => failures.push(self.failure(&item.id, &e)),
                }
            }

            let expanded = join_all(children.into_iter().map(|child| self.expand(child))).await;
            for (child, child_failures) in expanded {
                item.children.push(child);
                failures.extend(child_failures);
            }

            match item.kind {
                // Pages and databases have no reliable flag; the listing decides.
                ItemKind::Page | ItemKind::Database => item.has_children = !item.children.is_empty(),
                ItemKind::Block if item.children.is_empty() && failures.is_empty() => {
                    let e = FolioError::invalid_format("block reported children but none were returned");
                    failures.push(self.failure(&item.id, &e));
                }
                ItemKind::Block => {}
            }

            (item, failures)
        }
        .boxed()
    }
}
