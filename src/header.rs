// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 头部映射
//!
//! 大小写不敏感、保持插入顺序的多值头部表。键统一规范化为 Title-Case，
//! 因此 `content-type` 与 `Content-Type` 指向同一项，且不会出现重复键。

use crate::util::title_case;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderMap {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
    }

    /// 获取头部的值；多值时返回最后一个
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name)
            .and_then(|i| self.entries[i].1.last())
            .map(|v| v.as_str())
    }

    /// 获取头部的全部值
    pub fn get_all(&self, name: &str) -> &[String] {
        match self.position(name) {
            Some(i) => &self.entries[i].1,
            None => &[],
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// 设置头部，替换已有的全部值；已有的键保留原来的位置
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.position(name) {
            Some(i) => self.entries[i].1 = vec![value],
            None => self.entries.push((title_case(name), vec![value])),
        }
    }

    /// 追加一个值（例如多个 `Set-Cookie`）
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.position(name) {
            Some(i) => self.entries[i].1.push(value),
            None => self.entries.push((title_case(name), vec![value])),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.position(name).map(|i| self.entries.remove(i).1)
    }

    /// 按插入顺序遍历键及其值列表
    pub fn entries(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(key, values)| (key.as_str(), values.as_slice()))
    }

    /// 展开多值后的 (名称, 值) 序列
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().flat_map(|(key, values)| {
            values.iter().map(move |v| (key.as_str(), v.as_str()))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/plain");
        assert_eq!(headers.get("Content-Type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(headers.entries().next().unwrap().0, "Content-Type");
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut headers = HeaderMap::new();
        headers.insert("A", "1");
        headers.insert("B", "2");
        headers.insert("a", "3");
        let flat: Vec<_> = headers.iter().collect();
        assert_eq!(flat, vec![("A", "3"), ("B", "2")]);
    }

    #[test]
    fn test_append_keeps_all_values() {
        let mut headers = HeaderMap::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("set-cookie", "b=2");
        assert_eq!(headers.get_all("Set-Cookie"), &["a=1".to_string(), "b=2".to_string()]);
        assert_eq!(headers.get("Set-Cookie"), Some("b=2"));
        assert_eq!(headers.iter().count(), 2);
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Length", "5");
        assert_eq!(headers.remove("content-length"), Some(vec!["5".to_string()]));
        assert!(!headers.contains("Content-Length"));
        assert!(headers.get_all("Content-Length").is_empty());
    }
}
