// Copyright 2024 The Journal Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::cmp::Ordering;

use crate::v1::{process_spec::Id, Route};

impl Id {
    /// Orders process IDs on ascending (zone, suffix).
    pub fn cmp_id(&self, other: &Id) -> Ordering {
        (&self.zone, &self.suffix).cmp(&(&other.zone, &other.suffix))
    }

    pub fn format(&self) -> String {
        format!("{}#{}", self.zone, self.suffix)
    }
}

impl Route {
    /// An empty route with no primary.
    pub fn none() -> Route {
        Route {
            members: Vec::new(),
            primary: -1,
            endpoints: Vec::new(),
        }
    }

    /// Two routes are equivalent if members and primary agree. Endpoints
    /// are advisory and do not participate.
    pub fn equivalent(&self, other: &Route) -> bool {
        self.primary == other.primary && self.members == other.members
    }

    pub fn primary_id(&self) -> Option<&Id> {
        usize::try_from(self.primary)
            .ok()
            .and_then(|i| self.members.get(i))
    }

    pub fn index_of(&self, id: &Id) -> Option<usize> {
        self.members.iter().position(|m| m == id)
    }

    /// Endpoint advertised for |id|, if known.
    pub fn endpoint_of(&self, id: &Id) -> Option<&str> {
        self.index_of(id)
            .and_then(|i| self.endpoints.get(i))
            .map(|e| e.as_str())
            .filter(|e| !e.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(zone: &str, suffix: &str) -> Id {
        Id {
            zone: zone.to_string(),
            suffix: suffix.to_string(),
        }
    }

    fn route() -> Route {
        Route {
            members: vec![id("us-east", "a"), id("us-west", "b")],
            primary: 0,
            endpoints: vec!["http://a:8080".to_string(), "http://b:8080".to_string()],
        }
    }

    #[test]
    fn id_ordering() {
        assert_eq!(id("a", "z").cmp_id(&id("b", "a")), Ordering::Less);
        assert_eq!(id("a", "a").cmp_id(&id("a", "b")), Ordering::Less);
        assert_eq!(id("a", "a").cmp_id(&id("a", "a")), Ordering::Equal);
    }

    #[test]
    fn equivalence_ignores_endpoints() {
        let mut other = route();
        other.endpoints.clear();
        assert!(route().equivalent(&other));

        other.primary = 1;
        assert!(!route().equivalent(&other));

        let mut other = route();
        other.members.pop();
        assert!(!route().equivalent(&other));
    }

    #[test]
    fn primary_and_endpoints() {
        let r = route();
        assert_eq!(r.primary_id(), Some(&id("us-east", "a")));
        assert_eq!(r.endpoint_of(&id("us-west", "b")), Some("http://b:8080"));
        assert_eq!(r.endpoint_of(&id("eu", "c")), None);
        assert_eq!(Route::none().primary_id(), None);
    }
}
