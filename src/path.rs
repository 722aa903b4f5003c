//! 请求路径规范化：把任意请求路径约束在站点根目录之内。
//!
//! 解析基于路径段而非字符串拼接：空段与 `.` 被丢弃，`..` 只能弹出已保留的段，
//! 因此结果的前缀永远是根目录。这是词法层面的沙箱，后续所有文件操作都必须
//! 使用 [`SafePath`]。

use std::fmt;
use std::path::{Component, Path, PathBuf};

/// 经过 [`PathResolver`] 规范化、保证位于根目录内的路径。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SafePath {
    full: PathBuf,
    segments: Vec<String>,
}

impl SafePath {
    pub fn as_path(&self) -> &Path {
        &self.full
    }

    /// 相对根目录、以 `/` 分隔的路径；根目录本身为空串。
    pub fn relative(&self) -> String {
        self.segments.join("/")
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }
}

impl AsRef<Path> for SafePath {
    fn as_ref(&self) -> &Path {
        &self.full
    }
}

impl fmt::Display for SafePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.relative())
    }
}

#[derive(Clone, Debug)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 将请求路径解析为根目录内的安全路径。
    ///
    /// 已经以根目录开头的输入（例如回传的已解析路径）会先去掉根前缀再规范化，
    /// 所以对结果再次解析得到相同的值。
    pub fn resolve(&self, request: &str) -> SafePath {
        let remainder = self.strip_root_prefix(request).unwrap_or(request);
        self.build(push_segments(Vec::new(), remainder))
    }

    /// 以 `base` 为起点解析 `tail`，同样不会越过根目录。
    pub fn join(&self, base: &SafePath, tail: &str) -> SafePath {
        self.build(push_segments(base.segments.clone(), tail))
    }

    fn strip_root_prefix<'a>(&self, request: &'a str) -> Option<&'a str> {
        let root = self.root.to_str()?.trim_end_matches(['/', '\\']);
        if root.is_empty() {
            return None;
        }
        let rest = request.strip_prefix(root)?;
        // 只在分隔符边界处匹配，`/srv/www2` 不是 `/srv/www` 的子路径
        if rest.is_empty() || rest.starts_with(['/', '\\']) {
            Some(rest)
        } else {
            None
        }
    }

    fn build(&self, segments: Vec<String>) -> SafePath {
        let mut full = self.root.clone();
        for segment in &segments {
            full.push(segment);
        }
        SafePath { full, segments }
    }
}

fn push_segments(mut segments: Vec<String>, raw: &str) -> Vec<String> {
    for part in raw.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => {
                // 盘符等在当前平台上不是普通文件名的段直接丢弃
                let mut components = Path::new(other).components();
                if let (Some(Component::Normal(_)), None) = (components.next(), components.next())
                {
                    segments.push(other.to_string());
                }
            }
        }
    }
    segments
}
