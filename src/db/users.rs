// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Database users.
//!
//! Stored in `users.dat` as a schema-prefixed packed stream of
//! (name, password hash, access bits) triples. Passwords are salted
//! SHA-256, serialized as `salt$hexdigest`.

use std::path::{Path, PathBuf};

use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{Result, TdbError};
use crate::qpack::{Packer, Unpacker};

pub const USERS_FN: &str = "users.dat";
pub const USERS_SCHEMA: i64 = 1;

const SALT_LEN: usize = 8;

/// Default account created with a fresh database.
pub const DEFAULT_USER: &str = "admin";
pub const DEFAULT_PASSWORD: &str = "admin";

#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub password: String,
    pub access: u32,
}

pub fn hash_password(password: &str) -> String {
    let salt: String = (0..SALT_LEN)
        .map(|_| {
            let chars = b"abcdefghijklmnopqrstuvwxyz0123456789";
            chars[rand::thread_rng().gen_range(0..chars.len())] as char
        })
        .collect();
    hash_with_salt(password, &salt)
}

fn hash_with_salt(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{salt}${}", hex::encode(hasher.finalize()))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    match stored.split_once('$') {
        Some((salt, _)) => hash_with_salt(password, salt) == stored,
        None => false,
    }
}

pub struct Users {
    path: PathBuf,
    users: Vec<User>,
}

impl Users {
    /// Load `users.dat`, creating it with the default account when the
    /// database is fresh.
    pub fn load(db_path: &Path) -> Result<Users> {
        let path = db_path.join(USERS_FN);
        let mut users = Users {
            path,
            users: Vec::new(),
        };
        if !users.path.exists() {
            info!(user = DEFAULT_USER, "No users file found, creating default user");
            users.users.push(User {
                name: DEFAULT_USER.to_string(),
                password: hash_password(DEFAULT_PASSWORD),
                access: crate::db::access::PROFILE_FULL,
            });
            users.save()?;
            return Ok(users);
        }

        let data = std::fs::read(&users.path)?;
        let mut up = Unpacker::new(&data);
        let schema = up.expect_int()?;
        if schema != USERS_SCHEMA {
            return Err(TdbError::Corrupt(format!(
                "unsupported users schema {schema}"
            )));
        }
        while !up.at_end() {
            let name = up.expect_str()?.to_string();
            let password = up.expect_str()?.to_string();
            let access = up.expect_int()? as u32;
            users.users.push(User {
                name,
                password,
                access,
            });
        }
        Ok(users)
    }

    pub fn save(&self) -> Result<()> {
        let mut packer = Packer::new();
        packer.add_int(USERS_SCHEMA);
        for user in &self.users {
            packer.add_string(&user.name);
            packer.add_string(&user.password);
            packer.add_int(user.access as i64);
        }
        std::fs::write(&self.path, packer.as_slice())?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, User> {
        self.users.iter()
    }

    pub fn get(&self, name: &str) -> Option<&User> {
        self.users.iter().find(|u| u.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut User> {
        self.users.iter_mut().find(|u| u.name == name)
    }

    /// Authenticate; on success the caller attaches the user to the
    /// connection.
    pub fn authenticate(&self, name: &str, password: &str) -> Result<&User> {
        self.get(name)
            .filter(|u| verify_password(password, &u.password))
            .ok_or(TdbError::AuthCredentials)
    }

    pub fn create(&mut self, name: &str, password: &str, access: u32) -> Result<()> {
        if name.is_empty() {
            return Err(TdbError::Query("user name must not be empty".into()));
        }
        if self.get(name).is_some() {
            return Err(TdbError::Query(format!("user '{name}' already exists")));
        }
        self.users.push(User {
            name: name.to_string(),
            password: hash_password(password),
            access,
        });
        self.save()
    }

    pub fn drop_user(&mut self, name: &str) -> Result<()> {
        let before = self.users.len();
        self.users.retain(|u| u.name != name);
        if self.users.len() == before {
            return Err(TdbError::Query(format!("user '{name}' does not exist")));
        }
        self.save()
    }

    pub fn grant(&mut self, name: &str, bits: u32) -> Result<()> {
        match self.get_mut(name) {
            Some(user) => {
                user.access |= bits;
                self.save()
            }
            None => Err(TdbError::Query(format!("user '{name}' does not exist"))),
        }
    }

    pub fn revoke(&mut self, name: &str, bits: u32) -> Result<()> {
        match self.get_mut(name) {
            Some(user) => {
                user.access &= !bits;
                self.save()
            }
            None => Err(TdbError::Query(format!("user '{name}' does not exist"))),
        }
    }

    pub fn set_password(&mut self, name: &str, password: &str) -> Result<()> {
        match self.get_mut(name) {
            Some(user) => {
                user.password = hash_password(password);
                self.save()
            }
            None => Err(TdbError::Query(format!("user '{name}' does not exist"))),
        }
    }
}
