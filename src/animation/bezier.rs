//! 关键帧缓动曲线

/// 三次贝塞尔缓动曲线，起点 (0,0)、终点 (1,1)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BezierCurve {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Default for BezierCurve {
    fn default() -> Self {
        Self::linear()
    }
}

impl BezierCurve {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: x1.clamp(0.0, 1.0),
            y1,
            x2: x2.clamp(0.0, 1.0),
            y2,
        }
    }

    /// 线性
    pub fn linear() -> Self {
        Self::new(0.25, 0.25, 0.75, 0.75)
    }

    /// 缓入缓出
    pub fn ease_in_out() -> Self {
        Self::new(0.42, 0.0, 0.58, 1.0)
    }

    /// 对 [0,1] 的插值系数做缓动
    pub fn evaluate(&self, t: f32) -> f32 {
        if t <= 0.0 {
            return 0.0;
        }
        if t >= 1.0 {
            return 1.0;
        }
        let s = self.solve_parameter(t);
        cubic(s, self.y1, self.y2)
    }

    /// 牛顿迭代求曲线参数 s，使 x(s) = t
    fn solve_parameter(&self, t: f32) -> f32 {
        let mut s = t;
        for _ in 0..MAX_NEWTON_STEPS {
            let slope = cubic_slope(s, self.x1, self.x2);
            if slope.abs() < 1e-6 {
                break;
            }
            let next = (s - (cubic(s, self.x1, self.x2) - t) / slope).clamp(0.0, 1.0);
            let converged = (next - s).abs() < 1e-6;
            s = next;
            if converged {
                break;
            }
        }
        s
    }
}

const MAX_NEWTON_STEPS: usize = 15;

/// 端点固定为 0 和 1 的一维三次贝塞尔
fn cubic(s: f32, p1: f32, p2: f32) -> f32 {
    let inv = 1.0 - s;
    3.0 * inv * s * (inv * p1 + s * p2) + s * s * s
}

fn cubic_slope(s: f32, p1: f32, p2: f32) -> f32 {
    let inv = 1.0 - s;
    3.0 * inv * inv * p1 + 6.0 * inv * s * (p2 - p1) + 3.0 * s * s * (1.0 - p2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_is_identity() {
        let curve = BezierCurve::linear();
        for t in [0.1, 0.3, 0.5, 0.9] {
            assert!((curve.evaluate(t) - t).abs() < 1.0e-3);
        }
    }

    #[test]
    fn test_ease_in_out_is_symmetric() {
        let curve = BezierCurve::ease_in_out();
        assert!((curve.evaluate(0.5) - 0.5).abs() < 1.0e-3);
        assert!(curve.evaluate(0.2) < 0.2);
        assert!(curve.evaluate(0.8) > 0.8);
    }
}
