// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt::{Debug, Display};

use crate::holder::{Group, User};
use crate::track::Track;

/// Durable home of users, groups and tracks.
///
/// The manager only reads records when they are loaded and writes them back from a single ordered
/// persistence task, so implementations never see two writes for the same record at once.
pub trait Storage<U>: Send + Sync + 'static {
    type Error: Debug + Display + Send + Sync + 'static;

    /// Returns `None` if no user with this id was ever saved.
    fn load_user(&self, id: U) -> impl Future<Output = Result<Option<User<U>>, Self::Error>> + Send;

    fn load_group(&self, name: &str)
    -> impl Future<Output = Result<Option<Group>, Self::Error>> + Send;

    fn load_track(&self, name: &str)
    -> impl Future<Output = Result<Option<Track>, Self::Error>> + Send;

    fn save_user(&self, user: &User<U>) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn save_group(&self, group: &Group) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn save_track(&self, track: &Track) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn delete_group(&self, name: &str) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn delete_track(&self, name: &str) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
