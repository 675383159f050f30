//! Contract interfaces: events the indexer folds and the view functions it
//! batches through Multicall3.

use alloy_sol_types::sol;

sol! {
    /// Multicall3 - deployed at the same address on all EVM chains.
    interface IMulticall3 {
        struct Call3 {
            address target;
            bool allowFailure;
            bytes callData;
        }

        struct Result {
            bool success;
            bytes returnData;
        }

        function aggregate3(Call3[] calldata calls)
            external payable returns (Result[] memory returnData);
    }
}

sol! {
    interface IERC20 {
        function symbol() external view returns (string);
        function decimals() external view returns (uint8);
    }

    interface IUniswapV3Factory {
        event PoolCreated(
            address indexed token0,
            address indexed token1,
            uint24 indexed fee,
            int24 tickSpacing,
            address pool
        );

        function getPool(address tokenA, address tokenB, uint24 fee)
            external view returns (address pool);
    }

    interface IUniswapV3Pool {
        event Initialize(uint160 sqrtPriceX96, int24 tick);
        event Swap(
            address indexed sender,
            address indexed recipient,
            int256 amount0,
            int256 amount1,
            uint160 sqrtPriceX96,
            uint128 liquidity,
            int24 tick
        );

        function feeGrowthGlobal0X128() external view returns (uint256);
        function feeGrowthGlobal1X128() external view returns (uint256);
        function ticks(int24 tick) external view returns (
            uint128 liquidityGross,
            int128 liquidityNet,
            uint256 feeGrowthOutside0X128,
            uint256 feeGrowthOutside1X128,
            int56 tickCumulativeOutside,
            uint160 secondsPerLiquidityOutsideX128,
            uint32 secondsOutside,
            bool initialized
        );
    }

    interface INonfungiblePositionManager {
        event IncreaseLiquidity(
            uint256 indexed tokenId,
            uint128 liquidity,
            uint256 amount0,
            uint256 amount1
        );
        event DecreaseLiquidity(
            uint256 indexed tokenId,
            uint128 liquidity,
            uint256 amount0,
            uint256 amount1
        );
        event Collect(
            uint256 indexed tokenId,
            address recipient,
            uint256 amount0,
            uint256 amount1
        );
        event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);

        function positions(uint256 tokenId) external view returns (
            uint96 nonce,
            address operator,
            address token0,
            address token1,
            uint24 fee,
            int24 tickLower,
            int24 tickUpper,
            uint128 liquidity,
            uint256 feeGrowthInside0LastX128,
            uint256 feeGrowthInside1LastX128,
            uint128 tokensOwed0,
            uint128 tokensOwed1
        );
    }

    interface ILendingPair {
        event Deposit(
            address indexed caller,
            address indexed owner,
            uint256 assets,
            uint256 shares
        );
        event Withdraw(
            address indexed caller,
            address indexed receiver,
            address indexed owner,
            uint256 assets,
            uint256 shares
        );
        event BorrowAsset(
            address indexed _borrower,
            address indexed _receiver,
            uint256 _borrowAmount,
            uint256 _sharesAdded
        );
        event RepayAsset(
            address indexed payer,
            address indexed borrower,
            uint256 amountToRepay,
            uint256 shares
        );
        event RepayAssetWithCollateral(
            address indexed _borrower,
            address _swapperAddress,
            uint256 _collateralToSwap,
            uint256 _amountAssetOut,
            uint256 _sharesRepaid
        );
        event AddCollateral(
            address indexed sender,
            address indexed borrower,
            uint256 collateralAmount
        );
        event RemoveCollateral(
            address indexed _sender,
            uint256 _collateralAmount,
            address indexed _receiver,
            address indexed _borrower
        );
        event Liquidate(
            address indexed _borrower,
            uint256 _collateralForLiquidator,
            uint256 _sharesToLiquidate,
            uint256 _amountLiquidatorToRepay,
            uint256 _feesAmount,
            uint256 _sharesToAdjust,
            uint256 _amountToAdjust
        );
    }
}
