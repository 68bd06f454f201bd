//! Dial options and their precedence

use crate::admin::IpType;

/// Per-dial policy
///
/// `PublicIp`, `PrivateIp` and `PscIp` select the IP type and are mutually
/// exclusive: the last one given wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialOption {
    /// Connect over the instance's public address
    PublicIp,
    /// Connect over the instance's private (VPC) address
    PrivateIp,
    /// Connect over the instance's Private Service Connect address
    PscIp,
    /// Enable or disable IAM database authentication for this dial
    IamAuthn(bool),
}

/// Effective settings of a dial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialConfig {
    /// IP type to connect over
    pub ip_type: IpType,
    /// Whether the ephemeral certificate is requested for IAM database authentication
    pub iam_authn: bool,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            ip_type: IpType::Public,
            iam_authn: false,
        }
    }
}

impl DialConfig {
    /// Apply a single option
    pub fn apply(&mut self, opt: DialOption) {
        match opt {
            DialOption::PublicIp => self.ip_type = IpType::Public,
            DialOption::PrivateIp => self.ip_type = IpType::Private,
            DialOption::PscIp => self.ip_type = IpType::Psc,
            DialOption::IamAuthn(enabled) => self.iam_authn = enabled,
        }
    }

    /// Layer `opts` over these settings; later options override earlier ones
    pub fn merged<I>(mut self, opts: I) -> Self
    where
        I: IntoIterator<Item = DialOption>,
    {
        for opt in opts {
            self.apply(opt);
        }
        self
    }
}
