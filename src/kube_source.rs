// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Event source backed by the Kubernetes API.

use std::fmt::Debug;

use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{self, watcher, Event};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;

use crate::source::{EventSource, SourceEvent, WatchError};
use crate::store::ObjectKey;

impl ObjectKey for Pod {
    fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }

    fn name(&self) -> Option<&str> {
        self.metadata.name.as_deref()
    }
}

/// Watches a Kubernetes resource through the kube runtime watcher.
pub struct KubeSource<K> {
    api: Api<K>,
    config: watcher::Config,
}

impl<K> KubeSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Creates a source watching every object visible through `api`.
    pub fn new(api: Api<K>) -> Self {
        Self {
            api,
            config: watcher::Config::default(),
        }
    }

    /// Sets the watcher configuration (selectors, timeouts).
    pub fn with_config(mut self, config: watcher::Config) -> Self {
        self.config = config;
        self
    }
}

impl<K> EventSource<K> for KubeSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn events(&self) -> BoxStream<'static, Result<SourceEvent<K>, WatchError>> {
        let mut translator = EventTranslator::default();
        watcher(self.api.clone(), self.config.clone())
            .filter_map(move |event| futures::future::ready(translator.translate(event)))
            .boxed()
    }
}

/// Folds the watcher's initial-list events into a single listing.
struct EventTranslator<K> {
    listing: Option<Vec<K>>,
}

impl<K> Default for EventTranslator<K> {
    fn default() -> Self {
        Self { listing: None }
    }
}

impl<K> EventTranslator<K> {
    fn translate(
        &mut self,
        event: Result<Event<K>, watcher::Error>,
    ) -> Option<Result<SourceEvent<K>, WatchError>> {
        match event {
            Ok(Event::Init) => {
                self.listing = Some(Vec::new());
                None
            }
            Ok(Event::InitApply(obj)) => {
                self.listing.get_or_insert_with(Vec::new).push(obj);
                None
            }
            Ok(Event::InitDone) => Some(Ok(SourceEvent::Listed(
                self.listing.take().unwrap_or_default(),
            ))),
            Ok(Event::Apply(obj)) => Some(Ok(SourceEvent::Applied(obj))),
            Ok(Event::Delete(obj)) => Some(Ok(SourceEvent::Deleted(obj))),
            Err(e) => Some(Err(WatchError::Source(Box::new(e)))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use kube::api::ObjectMeta;

    fn pod(namespace: Option<&str>, name: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: namespace.map(str::to_string),
                name: name.map(str::to_string),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_pod_key() {
        assert_eq!(pod(Some("default"), Some("web")).key().unwrap(), "default/web");
        assert_eq!(pod(None, Some("web")).key().unwrap(), "web");
        assert!(pod(Some("default"), None).key().is_err());
    }

    fn names(event: Option<Result<SourceEvent<String>, WatchError>>) -> Option<(String, Vec<String>)> {
        match event? {
            Ok(SourceEvent::Listed(objs)) => Some(("listed".to_string(), objs)),
            Ok(SourceEvent::Applied(obj)) => Some(("applied".to_string(), vec![obj])),
            Ok(SourceEvent::Deleted(obj)) => Some(("deleted".to_string(), vec![obj])),
            Err(e) => Some(("error".to_string(), vec![e.to_string()])),
        }
    }

    #[test]
    fn test_initial_list_is_folded_into_one_listing() {
        let mut translator = EventTranslator::default();

        assert!(names(translator.translate(Ok(Event::Init))).is_none());
        assert!(names(translator.translate(Ok(Event::InitApply("a".to_string())))).is_none());
        assert!(names(translator.translate(Ok(Event::InitApply("b".to_string())))).is_none());
        assert_eq!(
            names(translator.translate(Ok(Event::InitDone))),
            Some(("listed".to_string(), vec!["a".to_string(), "b".to_string()]))
        );

        assert_eq!(
            names(translator.translate(Ok(Event::Apply("c".to_string())))),
            Some(("applied".to_string(), vec!["c".to_string()]))
        );
        assert_eq!(
            names(translator.translate(Ok(Event::Delete("a".to_string())))),
            Some(("deleted".to_string(), vec!["a".to_string()]))
        );
    }

    #[test]
    fn test_relist_starts_from_empty_listing() {
        let mut translator = EventTranslator::default();

        translator.translate(Ok(Event::Init));
        translator.translate(Ok(Event::InitApply("a".to_string())));
        translator.translate(Ok(Event::InitDone));

        translator.translate(Ok(Event::Init));
        assert_eq!(
            names(translator.translate(Ok(Event::InitDone))),
            Some(("listed".to_string(), Vec::new()))
        );
    }
}
