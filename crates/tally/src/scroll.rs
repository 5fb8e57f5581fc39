//! 📜 The Scroll Collector: "are there more?" "yes." "are there more?" "no." done.
//!
//! Opens a cursor over every record matching a term filter and reads pages in
//! order until the store hands back an empty one. Every page fetch refreshes
//! the store-side keep-alive; a fetch that fails (expired context, dropped
//! connection, anything) ends the run with `CursorExpired` and the caller
//! starts over. There is no resume. Scroll contexts don't do resumes.
//!
//! Two flavours: `collect` gathers every id into a Vec, and `stream` pushes ids
//! into a bounded channel as pages arrive, for the overlapped pipeline. 🦆

use async_channel::Sender;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{StoreError, TallyError, config_error};
use crate::store::{Cursor, SearchStore, TermFilter};

#[derive(Debug, Deserialize, Clone)]
pub struct ScrollConfig {
    /// 📄 Hits per page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page_size() -> usize {
    1000
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

impl ScrollConfig {
    pub fn validate(&self) -> Result<(), TallyError> {
        if self.page_size == 0 {
            return Err(config_error("scroll.page_size must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ScrollCollector<'s, S: SearchStore + ?Sized> {
    store: &'s S,
    collection: String,
    page_size: usize,
}

impl<'s, S: SearchStore + ?Sized> ScrollCollector<'s, S> {
    pub fn new(
        store: &'s S,
        collection: impl Into<String>,
        config: &ScrollConfig,
    ) -> Result<Self, TallyError> {
        config.validate()?;
        Ok(Self {
            store,
            collection: collection.into(),
            page_size: config.page_size,
        })
    }

    /// 🎯 Every matching id, in whatever order the store served them.
    pub async fn collect(&self, filter: &TermFilter) -> Result<Vec<String>, TallyError> {
        let mut cursor = self.open(filter).await?;
        let mut ids = Vec::new();
        while let Some(page) = self.next_page(&mut cursor, ids.len()).await? {
            ids.extend(page);
        }
        self.close(cursor).await;
        info!("📜 collected {} id(s) from '{}'", ids.len(), self.collection);
        Ok(ids)
    }

    /// 🚰 Push ids into `tx` as pages land. Backpressure comes free with a bounded channel.
    ///
    /// If the receiving side hangs up early (the aggregator bailed), we stop quietly
    /// and let the consumer's error tell the story. Returns how many ids were sent.
    pub async fn stream(&self, filter: &TermFilter, tx: Sender<String>) -> Result<usize, TallyError> {
        let mut cursor = self.open(filter).await?;
        let mut sent = 0usize;
        'pages: while let Some(page) = self.next_page(&mut cursor, sent).await? {
            for id in page {
                if tx.send(id).await.is_err() {
                    debug!("🔌 consumer hung up, scroll stream standing down");
                    break 'pages;
                }
                sent += 1;
            }
        }
        self.close(cursor).await;
        tx.close();
        info!("📜 streamed {sent} id(s) from '{}'", self.collection);
        Ok(sent)
    }

    async fn open(&self, filter: &TermFilter) -> Result<Cursor, TallyError> {
        self.store
            .open_scroll(&self.collection, filter, self.page_size)
            .await
            .map_err(|source| expired(0, source))
    }

    /// One page fetch. `None` once the store reports an empty page.
    async fn next_page(
        &self,
        cursor: &mut Cursor,
        collected: usize,
    ) -> Result<Option<Vec<String>>, TallyError> {
        let page = self
            .store
            .advance_scroll(cursor)
            .await
            .map_err(|source| expired(collected, source))?;
        if page.is_empty() {
            debug!("🏁 scroll on '{}' ran dry after {collected} id(s)", self.collection);
            return Ok(None);
        }
        Ok(Some(page.ids))
    }

    async fn close(&self, cursor: Cursor) {
        // -- 🗑️ release the store-side context now instead of waiting for the keep-alive to lapse
        if let Err(e) = self.store.clear_scroll(cursor).await {
            debug!("⚠️ clear_scroll failed, the store will expire it on its own: {e}");
        }
    }
}

fn expired(collected: usize, source: StoreError) -> TallyError {
    TallyError::CursorExpired { collected, source }
}
