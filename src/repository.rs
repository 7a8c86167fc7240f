use crate::error::{Code, Error, Page, Pagination};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;

/// One page of repository results.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResult<T> {
    pub items: Vec<T>,
    pub page: u64,
    pub total_pages: u64,
    pub total_size: u64,
}

impl<T> PageResult<T> {
    /// Pagination echo for the success envelope.
    pub fn pagination(&self, page_size: u64) -> Pagination {
        Pagination {
            page: self.page,
            page_size,
            total_pages: self.total_pages,
            total_size: self.total_size,
        }
    }
}

/// Anything storable in an entity repository.
pub trait Entity: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
}

/// Narrow interface over the external entity-persistence collaborator.
/// The core never sees the storage engine behind it.
#[async_trait]
pub trait Repository<T: Entity>: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<T>, Error>;
    async fn find_one(
        &self,
        matches: &(dyn for<'a> Fn(&'a T) -> bool + Sync),
    ) -> Result<Option<T>, Error>;
    async fn find_all(&self) -> Result<Vec<T>, Error>;
    async fn find_page(&self, page: Page) -> Result<PageResult<T>, Error>;
    /// Insert or replace by id.
    async fn save(&self, entity: T) -> Result<T, Error>;
    /// Hide the entity from reads without destroying it.
    async fn soft_delete(&self, id: &str) -> Result<bool, Error>;
    async fn delete(&self, id: &str) -> Result<bool, Error>;
}

struct Stored<T> {
    entity: T,
    deleted: bool,
}

/// In-process repository used by the demo controller and the tests.
pub struct MemoryRepository<T> {
    entities: DashMap<String, Stored<T>>,
}

impl<T: Entity> MemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            entities: DashMap::new(),
        }
    }

    fn live_sorted(&self) -> Vec<T> {
        let mut items: Vec<T> = self
            .entities
            .iter()
            .filter(|stored| !stored.deleted)
            .map(|stored| stored.entity.clone())
            .collect();
        items.sort_by(|left, right| left.id().cmp(right.id()));
        items
    }
}

impl<T: Entity> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for MemoryRepository<T> {
    async fn find_by_id(&self, id: &str) -> Result<Option<T>, Error> {
        Ok(self
            .entities
            .get(id)
            .filter(|stored| !stored.deleted)
            .map(|stored| stored.entity.clone()))
    }

    async fn find_one(
        &self,
        matches: &(dyn for<'a> Fn(&'a T) -> bool + Sync),
    ) -> Result<Option<T>, Error> {
        Ok(self
            .entities
            .iter()
            .find(|stored| !stored.deleted && matches(&stored.entity))
            .map(|stored| stored.entity.clone()))
    }

    async fn find_all(&self) -> Result<Vec<T>, Error> {
        Ok(self.live_sorted())
    }

    async fn find_page(&self, page: Page) -> Result<PageResult<T>, Error> {
        if page.page == 0 || page.page_size == 0 {
            return Err(Error::with_message(
                Code::ParameterError,
                "page and pageSize must be >= 1",
            ));
        }

        let all = self.live_sorted();
        let total_size = all.len() as u64;
        let total_pages = total_size.div_ceil(page.page_size);
        let start = ((page.page - 1) * page.page_size) as usize;
        let items = all
            .into_iter()
            .skip(start)
            .take(page.page_size as usize)
            .collect();

        Ok(PageResult {
            items,
            page: page.page,
            total_pages,
            total_size,
        })
    }

    async fn save(&self, entity: T) -> Result<T, Error> {
        self.entities.insert(
            entity.id().to_string(),
            Stored {
                entity: entity.clone(),
                deleted: false,
            },
        );
        Ok(entity)
    }

    async fn soft_delete(&self, id: &str) -> Result<bool, Error> {
        match self.entities.get_mut(id) {
            Some(mut stored) if !stored.deleted => {
                stored.deleted = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, Error> {
        Ok(self.entities.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::{Entity, MemoryRepository, Repository};
    use crate::error::Page;

    #[derive(Debug, Clone, PartialEq)]
    struct User {
        id: String,
        name: String,
    }

    impl Entity for User {
        fn id(&self) -> &str {
            &self.id
        }
    }

    fn user(id: &str, name: &str) -> User {
        User {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn save_and_find() {
        let repo = MemoryRepository::new();
        repo.save(user("1", "alice")).await.expect("save");

        let found = repo.find_by_id("1").await.expect("find");
        assert_eq!(found, Some(user("1", "alice")));

        let by_name = repo
            .find_one(&|candidate: &User| candidate.name == "alice")
            .await
            .expect("find_one");
        assert_eq!(by_name, Some(user("1", "alice")));
    }

    #[tokio::test]
    async fn soft_delete_hides_but_keeps() {
        let repo = MemoryRepository::new();
        repo.save(user("1", "alice")).await.expect("save");

        assert!(repo.soft_delete("1").await.expect("soft_delete"));
        assert_eq!(repo.find_by_id("1").await.expect("find"), None);
        assert!(repo.find_all().await.expect("find_all").is_empty());

        // Hard delete still sees the row.
        assert!(repo.delete("1").await.expect("delete"));
    }

    #[tokio::test]
    async fn pagination_math() {
        let repo = MemoryRepository::new();
        for index in 1..=5 {
            repo.save(user(&format!("{index}"), "user"))
                .await
                .expect("save");
        }

        let result = repo
            .find_page(Page {
                page: 2,
                page_size: 2,
            })
            .await
            .expect("find_page");
        assert_eq!(result.total_size, 5);
        assert_eq!(result.total_pages, 3);
        assert_eq!(result.items.len(), 2);
        assert_eq!(result.items[0].id, "3");
    }
}
